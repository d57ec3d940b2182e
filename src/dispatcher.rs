// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Supervisor
//!
//! [`RabbitMQDispatcher`] keeps a delivery stream open on the configured queue
//! for as long as the process runs. Stream intake and handler execution run on
//! separate tasks so a slow handler does not stall intake.
//!
//! The loop moves through `Starting → Consuming → Reconnecting → Consuming`.
//! It blocks on the connection's failure signal; when the signal fires it
//! recovers the connection and re-opens the stream on the new channel. If the
//! publisher recovered first, the loop only re-opens the stream. A failed
//! reconnect or stream open is terminal: it is logged and returned from
//! [`run`](RabbitMQDispatcher::run) so the host can stop, rather than retrying
//! against a broker that is gone.
//!
//! Closing the connection with
//! [`RabbitMQConnection::close`] ends the loop without an error.
//!
//! Deliveries in flight when the connection fails may be lost; nothing here
//! redelivers them.

use crate::{
    channel::DeliveryStream,
    connection::RabbitMQConnection,
    consumer::{spawn_worker, ConsumerHandler},
    errors::AmqpError,
    message::Delivery,
};
use futures_util::StreamExt;
use std::{future, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Deliveries buffered between intake and the handler when no prefetch is set.
pub const DEFAULT_HANDLER_BUFFER: usize = 64;

/// Lifecycle of a consumer supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Opening the first delivery stream.
    Starting,
    Consuming,
    /// Replacing the delivery stream after a reconnect.
    Reconnecting,
    /// `run` returned.
    Stopped,
}

enum Event {
    Failure,
    Replaced,
    StreamEnded,
}

/// Consumer supervisor for the queue of a [`RabbitMQConnection`].
pub struct RabbitMQDispatcher {
    conn: Arc<RabbitMQConnection>,
    state: watch::Sender<ConsumerState>,
}

impl RabbitMQDispatcher {
    /// Creates a supervisor for the queue of `conn`. Nothing is consumed until
    /// [`run`](Self::run) or [`spawn`](Self::spawn).
    pub fn new(conn: Arc<RabbitMQConnection>) -> Arc<RabbitMQDispatcher> {
        let (state, _) = watch::channel(ConsumerState::Starting);
        Arc::new(RabbitMQDispatcher { conn, state })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Runs [`run`](Self::run) on a dedicated background task.
    pub fn spawn(
        self: &Arc<Self>,
        auto_ack: bool,
        handler: Arc<dyn ConsumerHandler>,
    ) -> JoinHandle<Result<(), AmqpError>> {
        let dispatcher = self.clone();
        tokio::spawn(async move { dispatcher.run(auto_ack, handler).await })
    }

    /// Consumes the configured queue until a fatal error or until the
    /// connection is closed.
    pub async fn run(
        &self,
        auto_ack: bool,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let result = self.supervise(auto_ack, handler).await;
        self.state.send_replace(ConsumerState::Stopped);
        result
    }

    async fn supervise(
        &self,
        auto_ack: bool,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        self.state.send_replace(ConsumerState::Starting);

        let signal = self.conn.signal().clone();
        let mut generation = self.conn.watch_generation();
        generation.borrow_and_update();

        let mut intake = Some(self.open(auto_ack, handler.clone()).await?);

        loop {
            self.state.send_replace(ConsumerState::Consuming);

            let event = tokio::select! {
                _ = signal.wait() => Event::Failure,
                changed = generation.changed() => match changed {
                    Ok(()) => Event::Replaced,
                    Err(_) => return Err(AmqpError::InternalError("connection dropped".to_owned())),
                },
                _ = async {
                    match intake.as_mut() {
                        Some(handle) => handle.await,
                        None => future::pending().await,
                    }
                } => Event::StreamEnded,
            };

            if self.conn.is_closed() {
                info!("amqp connection closed, stopping consumer");
                return Ok(());
            }

            match event {
                Event::StreamEnded => {
                    intake = None;
                    if !self.conn.needs_recovery() && !generation.has_changed().unwrap_or(false) {
                        warn!("delivery stream ended, treating as channel loss");
                        signal.raise();
                    }
                    continue;
                }
                Event::Failure => match self.conn.recover().await {
                    None if !generation.has_changed().unwrap_or(false) => continue,
                    None => {}
                    Some(Ok(())) => {}
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "failure to reconnect consumer, giving up");
                        return Err(err);
                    }
                },
                Event::Replaced => {}
            }

            self.state.send_replace(ConsumerState::Reconnecting);
            if let Some(handle) = intake.take() {
                handle.abort();
            }

            generation.borrow_and_update();
            intake = Some(self.open(auto_ack, handler.clone()).await?);
        }
    }

    /// Opens a delivery stream on the current channel and starts its intake
    /// and handler tasks. Returns the intake task, which ends with the stream.
    async fn open(
        &self,
        auto_ack: bool,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<JoinHandle<()>, AmqpError> {
        let queue = self.conn.descriptor().queue_name();
        let tag = format!("{}-{}", self.conn.descriptor().name(), Uuid::new_v4());

        let stream = match self.conn.channel().await {
            Ok(channel) => channel.basic_consume(queue, &tag, auto_ack).await,
            Err(err) => Err(AmqpError::ConsumerDeclarationError(err.to_string())),
        }
        .map_err(|err| {
            error!(error = err.to_string(), queue = queue, "error to create the consumer");
            err
        })?;

        info!(queue = queue, consumer_tag = tag.as_str(), "consuming queue");

        let capacity = match self.conn.descriptor().prefetch_count() {
            0 => DEFAULT_HANDLER_BUFFER,
            prefetch => prefetch as usize,
        };
        let (tx, rx) = mpsc::channel(capacity);
        spawn_worker(handler, rx);

        Ok(spawn_intake(stream, tx))
    }
}

fn spawn_intake(mut stream: DeliveryStream, deliveries: mpsc::Sender<Delivery>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(delivery) => {
                    if deliveries.send(delivery).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    break;
                }
            }
        }
    })
}
