// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervisor
//!
//! [`RabbitMQConnection`] owns one logical connection to the broker: the live
//! session (connection + channel), the [`FailureSignal`] its transport raises
//! on loss, and the [`TopologyDescriptor`] used to rebuild everything on
//! [`reconnect`](RabbitMQConnection::reconnect).
//!
//! The supervisor never retries on its own. Recovery is driven by whoever
//! observes the failure first: the consumer loop or the next publish call.
//! Reconnects are serialized, and each successful one bumps a generation
//! counter so that an observer who did not drive it can still notice that the
//! session was replaced.

use crate::{
    channel::{Broker, BrokerChannel, LapinBroker},
    config::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeKind,
    signal::{CloseListener, FailureSignal},
    topology::{AmqpTopology, TopologyDescriptor},
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{watch, Mutex, RwLock},
    time::timeout,
};
use tracing::{debug, error, info, warn};

struct Session {
    channel: Arc<dyn BrokerChannel>,
    listener: CloseListener,
}

impl Session {
    async fn retire(self) {
        self.listener.disarm();
        if let Err(err) = self.channel.close().await {
            debug!(error = err.to_string(), "error closing retired session");
        }
    }
}

/// Supervises a single broker connection.
pub struct RabbitMQConnection {
    descriptor: TopologyDescriptor,
    topology: AmqpTopology,
    broker: Arc<dyn Broker>,
    session: RwLock<Option<Session>>,
    signal: Arc<FailureSignal>,
    generation: watch::Sender<u64>,
    reconnecting: Mutex<()>,
    closed: AtomicBool,
}

impl RabbitMQConnection {
    /// Creates a supervisor without connecting.
    pub fn new(descriptor: TopologyDescriptor, broker: Arc<dyn Broker>) -> Arc<RabbitMQConnection> {
        let (generation, _) = watch::channel(0);

        Arc::new(RabbitMQConnection {
            topology: AmqpTopology::new(&descriptor),
            descriptor,
            broker,
            session: RwLock::new(None),
            signal: Arc::new(FailureSignal::new()),
            generation,
            reconnecting: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Creates a supervisor, connects and declares the topology.
    ///
    /// Startup errors are returned as is; a service should not run with a
    /// half-configured broker.
    pub async fn open(
        descriptor: TopologyDescriptor,
        broker: Arc<dyn Broker>,
    ) -> Result<Arc<RabbitMQConnection>, AmqpError> {
        let conn = RabbitMQConnection::new(descriptor, broker);
        conn.reconnect().await?;

        info!(uri = conn.redacted_uri(), "rmq connected");
        Ok(conn)
    }

    /// Opens a `lapin` backed supervisor from loaded configs.
    pub async fn from_configs(
        app_name: &str,
        cfg: &RabbitMQConfigs,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
    ) -> Result<Arc<RabbitMQConnection>, AmqpError> {
        let descriptor = TopologyDescriptor::from_configs(app_name, cfg, exchange, kind, queue)?;
        RabbitMQConnection::open(descriptor, LapinBroker::new()).await
    }

    /// Dials the broker, opens a channel and applies QoS. Replaces the current
    /// session and reopens a closed supervisor; no topology is declared.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.closed.store(false, Ordering::SeqCst);
        let session = self.open_session().await?;
        if let Some(previous) = self.swap(session).await {
            previous.retire().await;
        }
        Ok(())
    }

    /// Declares exchange, queue and binding on the current channel.
    pub async fn declare_topology(&self) -> Result<(), AmqpError> {
        let channel = self.channel().await?;
        self.bounded(self.topology.install(channel.as_ref())).await
    }

    /// Applies the configured prefetch to the current channel. A rejection is
    /// logged and ignored.
    pub async fn set_qos(&self) {
        if let Ok(channel) = self.channel().await {
            self.apply_qos(channel.as_ref()).await;
        }
    }

    /// Replaces the session with a freshly connected and declared one.
    ///
    /// A new session only becomes current once its topology is declared. On
    /// error the half-built session is discarded, the old one is retired and the
    /// failure is left pending, so no caller ever sees a partially declared
    /// channel as live. No retry or backoff is applied. Reopens a supervisor
    /// shut down with [`close`](Self::close).
    pub async fn reconnect(&self) -> Result<(), AmqpError> {
        let _guard = self.reconnecting.lock().await;
        self.closed.store(false, Ordering::SeqCst);
        self.reconnect_locked().await
    }

    /// Reconnects if a failure is pending, draining it.
    ///
    /// Returns `None` when there was nothing to recover, including when another
    /// caller recovered while this one waited for the reconnect lock, and when
    /// the supervisor was closed.
    pub async fn recover(&self) -> Option<Result<(), AmqpError>> {
        let _guard = self.reconnecting.lock().await;
        if self.is_closed() || !self.signal.is_pending() {
            return None;
        }

        Some(self.reconnect_locked().await)
    }

    /// Non-blocking check for a pending failure or an in-flight reconnect.
    pub fn needs_recovery(&self) -> bool {
        self.signal.is_pending() || self.reconnecting.try_lock().is_err()
    }

    async fn reconnect_locked(&self) -> Result<(), AmqpError> {
        self.signal.take();

        debug!("reconnecting amqp session...");
        let result = match self.open_session().await {
            Ok(session) => {
                let declared = self
                    .bounded(self.topology.install(session.channel.as_ref()))
                    .await;
                match declared {
                    Ok(()) => Ok(session),
                    Err(err) => {
                        session.retire().await;
                        Err(err)
                    }
                }
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(session) => {
                let previous = self.swap(session).await;
                self.generation.send_modify(|g| *g += 1);
                info!(generation = self.generation(), "amqp session reestablished");

                if let Some(previous) = previous {
                    previous.retire().await;
                }
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to reconnect");
                let old = self.session.write().await.take();
                if let Some(old) = old {
                    old.retire().await;
                }
                self.signal.raise();
                Err(err)
            }
        }
    }

    /// Shuts the supervisor down.
    ///
    /// The session is retired and automatic recovery stops: publishes fail
    /// until an explicit [`reconnect`](Self::reconnect), and a running consumer
    /// loop returns.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let session = self.session.write().await.take();
        if let Some(session) = session {
            session.retire().await;
            info!("amqp session closed");
        }
    }

    /// The current channel, or `ChannelError` when no session is live.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or_else(|| AmqpError::ChannelError("no live amqp session".to_owned()))
    }

    /// Whether [`close`](Self::close) was called since the last explicit
    /// reconnect.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }

    pub fn descriptor(&self) -> &TopologyDescriptor {
        &self.descriptor
    }

    pub fn signal(&self) -> &Arc<FailureSignal> {
        &self.signal
    }

    /// Number of successful reconnects so far.
    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Receiver notified after every successful reconnect.
    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Dials a session and applies QoS. Each step is bounded on its own, and
    /// a session that fails after the dial is retired before returning.
    async fn open_session(&self) -> Result<Session, AmqpError> {
        let listener = CloseListener::new(self.signal.clone());

        let channel = match self
            .bounded(self.broker.connect(
                self.descriptor.uri(),
                self.descriptor.name(),
                listener.clone(),
            ))
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                listener.disarm();
                return Err(err);
            }
        };

        let session = Session { channel, listener };
        if timeout(self.descriptor.timeout(), self.apply_qos(session.channel.as_ref()))
            .await
            .is_err()
        {
            session.retire().await;
            return Err(self.timed_out());
        }

        Ok(session)
    }

    async fn apply_qos(&self, channel: &dyn BrokerChannel) {
        let prefetch = self.descriptor.prefetch_count();
        if prefetch == 0 {
            return;
        }

        if let Err(err) = channel.basic_qos(prefetch).await {
            warn!(error = err.to_string(), prefetch = prefetch, "qos rejected, ignoring");
        }
    }

    async fn swap(&self, session: Session) -> Option<Session> {
        self.session.write().await.replace(session)
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, AmqpError>>,
    ) -> Result<T, AmqpError> {
        match timeout(self.descriptor.timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out()),
        }
    }

    fn timed_out(&self) -> AmqpError {
        AmqpError::ConnectionError(format!(
            "timed out after {}ms",
            self.descriptor.timeout().as_millis()
        ))
    }

    fn redacted_uri(&self) -> String {
        let uri = self.descriptor.uri();
        match (uri.find("://"), uri.rfind('@')) {
            (Some(scheme), Some(at)) if at > scheme => {
                format!("{}://***{}", &uri[..scheme], &uri[at..])
            }
            _ => uri.to_owned(),
        }
    }
}
