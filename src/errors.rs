// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Supervisor
//!
//! This module provides the error type shared by every component of the crate.
//! The `AmqpError` enum represents all failure scenarios that can occur while
//! connecting, declaring topology, publishing and consuming. Variants are grouped
//! into coarse [`ErrorKind`]s so callers can apply one policy per kind.

use thiserror::Error;

/// Coarse classification of an [`AmqpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Dial or channel-open failure.
    Connect,
    /// Exchange/queue declaration or binding rejected by the broker.
    Topology,
    /// Send failed on an otherwise live channel.
    Publish,
    /// The delivery stream could not be opened.
    ConsumeOpen,
    /// Everything else.
    Other,
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Variants carrying a `String` hold either the entity name involved or the
/// transport error text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error: {0}")]
    InternalError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error opening the delivery stream of a queue
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The exchange type string is not one the broker understands
    #[error("unknown exchange kind `{0}`")]
    InvalidExchangeKind(String),

    /// A required configuration key is missing or malformed
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// A consumer handler reported a failure
    #[error("handler failure: {0}")]
    HandlerError(String),
}

impl AmqpError {
    /// Returns the kind this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_) => ErrorKind::Connect,
            AmqpError::DeclareExchangeError(_)
            | AmqpError::DeclareQueueError(_)
            | AmqpError::BindingExchangeToQueueError(_, _) => ErrorKind::Topology,
            AmqpError::PublishingError(_) => ErrorKind::Publish,
            AmqpError::ConsumerDeclarationError(_) => ErrorKind::ConsumeOpen,
            _ => ErrorKind::Other,
        }
    }
}
