// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Supervisor
//!
//! Keeps one AMQP connection, with its exchange, queue and binding, alive for
//! the lifetime of a service. Publishers and the consumer loop share a
//! [`connection::RabbitMQConnection`]; whichever notices a lost connection
//! first rebuilds the session and redeclares the topology.

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod signal;
pub mod topology;

#[cfg(test)]
mod test_helpers;

pub use connection::RabbitMQConnection;
pub use consumer::ConsumerHandler;
pub use dispatcher::{ConsumerState, RabbitMQDispatcher};
pub use errors::{AmqpError, ErrorKind};
pub use message::{Delivery, Message};
pub use publisher::{Publisher, RabbitMQPublisher};
pub use topology::TopologyDescriptor;
