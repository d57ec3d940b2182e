// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Deliveries
//!
//! Outbound [`Message`]s are built per publish call and dropped once the call
//! returns. Inbound [`Delivery`]s are what the broker hands to a consumer
//! handler; payloads are opaque bytes for the supervisor.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use serde::Serialize;
use std::{fmt, sync::Arc};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Header carrying the payload type of a message
pub const AMQP_HEADERS_TYPE: &str = "type";

/// Payload of a message together with its application-level type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBody {
    pub data: Vec<u8>,
    pub msg_type: String,
}

/// A message to publish.
///
/// `to` is used as the routing key: the destination queue name when the
/// supervisor publishes through the default exchange, or the key the configured
/// exchange routes on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub to: String,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: Option<u8>,
    pub body: MessageBody,
}

impl Message {
    pub fn new(to: &str, msg_type: &str, data: Vec<u8>) -> Message {
        Message {
            to: to.to_owned(),
            body: MessageBody {
                data,
                msg_type: msg_type.to_owned(),
            },
            ..Default::default()
        }
    }

    /// Builds a message whose payload is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(to: &str, msg_type: &str, payload: &T) -> Result<Message, AmqpError> {
        let data = serde_json::to_vec(payload)
            .map_err(|err| AmqpError::InternalError(format!("encoding payload: {err}")))?;

        Ok(Message::new(to, msg_type, data).content_type(JSON_CONTENT_TYPE))
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn correlation_id(mut self, id: &str) -> Self {
        self.correlation_id = Some(id.to_owned());
        self
    }

    pub fn reply_to(mut self, queue: &str) -> Self {
        self.reply_to = Some(queue.to_owned());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Settles a delivery with the broker.
///
/// Only meaningful when consuming with manual acknowledgment; doing so is the
/// handler's responsibility.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message instance handed from the broker to a consumer handler.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub(crate) acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties,
            data,
            acker,
        }
    }

    /// Application-level type, read from the `type` header.
    pub fn msg_type(&self) -> String {
        match self.headers().inner().get(AMQP_HEADERS_TYPE) {
            Some(AMQPValue::LongString(value)) => {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            }
            Some(AMQPValue::ShortString(value)) => value.to_string(),
            _ => String::new(),
        }
    }

    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    pub fn content_type(&self) -> Option<String> {
        self.properties.content_type().as_ref().map(|v| v.to_string())
    }

    pub fn correlation_id(&self) -> Option<String> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(|v| v.to_string())
    }

    pub fn reply_to(&self) -> Option<String> {
        self.properties.reply_to().as_ref().map(|v| v.to_string())
    }

    pub fn priority(&self) -> Option<u8> {
        *self.properties.priority()
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}
