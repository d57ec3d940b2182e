// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides the [`TopologyDescriptor`], the immutable description of
//! everything a supervisor needs to know about its broker, and [`AmqpTopology`],
//! which declares that topology on a channel.
//!
//! The declaration policy is fixed: exchanges and queues are durable and never
//! auto-deleted, queues are not exclusive, and a queue is bound to the exchange
//! with an empty routing key whenever both are configured.

use crate::{
    channel::BrokerChannel,
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
};
use std::time::Duration;
use tracing::debug;

/// Default bound for each step of opening a session: dial, QoS and declare.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Immutable configuration of one supervised connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    uri: String,
    connection_name: String,
    exchange: String,
    exchange_kind: ExchangeKind,
    queue: String,
    prefetch: u16,
    connect_timeout: Duration,
}

impl TopologyDescriptor {
    /// Creates a descriptor with no exchange, no queue and no prefetch limit.
    pub fn new(uri: &str) -> TopologyDescriptor {
        TopologyDescriptor {
            uri: uri.to_owned(),
            connection_name: String::new(),
            exchange: String::new(),
            exchange_kind: ExchangeKind::default(),
            queue: String::new(),
            prefetch: 0,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Builds a descriptor from loaded configs. `queue` is the use-case key
    /// looked up in the configured queue names; an empty key means no queue.
    pub fn from_configs(
        app_name: &str,
        cfg: &RabbitMQConfigs,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
    ) -> Result<TopologyDescriptor, AmqpError> {
        let mut descriptor = TopologyDescriptor::new(&cfg.uri())
            .connection_name(app_name)
            .exchange(exchange, kind)
            .prefetch(cfg.qos)
            .connect_timeout(cfg.connect_timeout());

        if !queue.is_empty() {
            let name = cfg
                .queue(queue)
                .ok_or_else(|| AmqpError::ConfigError(format!("queue.{queue}")))?;
            descriptor = descriptor.queue(name);
        }

        Ok(descriptor)
    }

    /// Name reported to the broker and used as the consumer tag prefix.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    /// Exchange to declare. An empty name declares no exchange.
    pub fn exchange(mut self, name: &str, kind: ExchangeKind) -> Self {
        self.exchange = name.to_owned();
        self.exchange_kind = kind;
        self
    }

    /// Queue to declare and consume. An empty name declares no queue.
    pub fn queue(mut self, name: &str) -> Self {
        self.queue = name.to_owned();
        self
    }

    /// Per-channel prefetch applied with `basic.qos`; 0 leaves it unlimited.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = count;
        self
    }

    /// Bound applied separately to the dial, QoS and declare steps.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// AMQP URI the supervisor dials.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Connection name; empty when unset.
    pub fn name(&self) -> &str {
        &self.connection_name
    }

    /// Exchange name; empty when no exchange is declared.
    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    /// Exchange type used for the declaration.
    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.exchange_kind
    }

    /// Queue name; empty when no queue is declared.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Prefetch count, 0 when unlimited.
    pub fn prefetch_count(&self) -> u16 {
        self.prefetch
    }

    /// Per-step bound for opening a session.
    pub fn timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// The declarations derived from a [`TopologyDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpTopology {
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) queue: Option<QueueDefinition>,
    pub(crate) binding: Option<QueueBinding>,
}

impl AmqpTopology {
    pub fn new(descriptor: &TopologyDescriptor) -> AmqpTopology {
        let exchange = (!descriptor.exchange.is_empty()).then(|| {
            ExchangeDefinition::new(&descriptor.exchange)
                .kind(descriptor.exchange_kind.clone())
                .durable()
        });

        let queue = (!descriptor.queue.is_empty())
            .then(|| QueueDefinition::new(&descriptor.queue).durable());

        let binding = match (&exchange, &queue) {
            (Some(exch), Some(queue)) => Some(
                QueueBinding::new(&queue.name)
                    .exchange(&exch.name)
                    .routing_key(""),
            ),
            _ => None,
        };

        AmqpTopology {
            exchange,
            queue,
            binding,
        }
    }

    /// Declares the topology on `channel`.
    ///
    /// This method performs the following operations in order, stopping at the
    /// first rejection:
    /// 1. Declares the exchange
    /// 2. Declares the queue
    /// 3. Binds the queue to the exchange
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchange(channel).await?;
        self.install_queue(channel).await?;
        self.binding_queue(channel).await
    }

    async fn install_exchange(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let Some(exch) = &self.exchange else {
            return Ok(());
        };

        debug!("creating exchange: {}", exch.name);
        channel.exchange_declare(exch).await?;
        debug!("exchange: {} was created", exch.name);

        Ok(())
    }

    async fn install_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };

        debug!("creating queue: {}", queue.name);
        channel.queue_declare(queue).await?;
        debug!("queue: {} was created", queue.name);

        Ok(())
    }

    async fn binding_queue(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        let Some(binding) = &self.binding else {
            return Ok(());
        };

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );
        channel.queue_bind(binding).await?;
        debug!("queue was bounded");

        Ok(())
    }
}
