// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages through a
//! supervised connection. Before every send the publisher checks the
//! connection's failure signal without blocking; a pending failure triggers a
//! reconnect first. OpenTelemetry context is propagated in the message headers.
//!
//! Publishes are not serialized here. Callers that need single-writer access to
//! the channel must serialize concurrent calls themselves.

use crate::{
    connection::RabbitMQConnection,
    errors::AmqpError,
    message::{Message, AMQP_HEADERS_TYPE},
    otel::RabbitMQTracePropagator,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Sends messages to the broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, msg: &Message) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
///
/// Messages go to the exchange configured on the connection (the default
/// exchange when none is configured) with [`Message::to`] as routing key.
pub struct RabbitMQPublisher {
    conn: Arc<RabbitMQConnection>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher on a supervised connection.
    pub fn new(conn: Arc<RabbitMQConnection>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { conn })
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    /// Publishes a message to RabbitMQ.
    ///
    /// A failed recovery is logged and the send is attempted anyway; if there
    /// is no live channel the send then fails with `PublishingError`. Send
    /// failures are returned to the caller and not retried.
    async fn publish(&self, ctx: &Context, msg: &Message) -> Result<(), AmqpError> {
        if self.conn.needs_recovery() {
            warn!("pending connection failure, recovering before publish");
            if let Some(Err(err)) = self.conn.recover().await {
                error!(error = err.to_string(), "failure to reconnect before publish");
            }
        }

        let channel = self
            .conn
            .channel()
            .await
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        let exchange = self.conn.descriptor().exchange_name();

        match channel
            .basic_publish(exchange, &msg.to, &msg.body.data, self.properties(ctx, msg))
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = exchange,
                    key = msg.to.as_str(),
                    "error publishing message"
                );
                Err(err)
            }
            _ => {
                debug!(exchange = exchange, key = msg.to.as_str(), "message published");
                Ok(())
            }
        }
    }
}

impl RabbitMQPublisher {
    fn properties(&self, ctx: &Context, msg: &Message) -> BasicProperties {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut btree))
        });

        btree.insert(
            ShortString::from(AMQP_HEADERS_TYPE),
            AMQPValue::LongString(LongString::from(msg.body.msg_type.clone())),
        );

        let mut props = BasicProperties::default()
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));

        if let Some(content_type) = &msg.content_type {
            props = props.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(id) = &msg.correlation_id {
            props = props.with_correlation_id(ShortString::from(id.clone()));
        }
        if let Some(reply_to) = &msg.reply_to {
            props = props.with_reply_to(ShortString::from(reply_to.clone()));
        }
        if let Some(priority) = msg.priority {
            props = props.with_priority(priority);
        }

        props
    }
}
