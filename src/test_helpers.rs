// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Routes like RabbitMQ for the subset the supervisor uses: the default
//! exchange delivers to the queue named by the routing key, fanout exchanges
//! deliver to every bound queue, direct and topic exchanges deliver to queues
//! bound with the exact key. Messages published while a queue has no consumer
//! are buffered. [`MemoryBroker::kill_connections`] simulates a network failure.

use crate::{
    channel::{Broker, BrokerChannel, DeliveryStream},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{Acknowledger, Delivery},
    queue::{QueueBinding, QueueDefinition},
    signal::CloseListener,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, VecDeque},
    ops::Deref,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

type Sender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

struct Stored {
    exchange: String,
    routing_key: String,
    properties: BasicProperties,
    data: Vec<u8>,
}

#[derive(Default)]
struct MemoryQueue {
    buffer: VecDeque<Stored>,
    consumers: Vec<(u64, Sender)>,
}

struct MemoryConnection {
    listener: CloseListener,
    open: Arc<AtomicBool>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, MemoryQueue>,
    bindings: Vec<(String, String, String)>,
    connections: HashMap<u64, MemoryConnection>,
    prefetch: Option<u16>,
}

#[derive(Default)]
pub(crate) struct Inner {
    state: Mutex<State>,
    unreachable: AtomicBool,
    reject_qos: AtomicBool,
    connects: AtomicUsize,
    next_id: AtomicU64,
    next_tag: AtomicU64,
    delay_ms: AtomicU64,
    declare_delay_ms: AtomicU64,
}

pub(crate) struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Deref for MemoryBroker {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.inner
    }
}

impl MemoryBroker {
    pub(crate) fn new() -> Arc<MemoryBroker> {
        Arc::new(MemoryBroker {
            inner: Arc::new(Inner::default()),
        })
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub(crate) fn reject_qos(&self, reject: bool) {
        self.reject_qos.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes every exchange declaration stall for `delay`.
    pub(crate) fn set_declare_delay(&self, delay: Duration) {
        self.declare_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Pre-declares an exchange as if another service had created it.
    pub(crate) fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.state
            .lock()
            .unwrap()
            .exchanges
            .insert(name.to_owned(), kind);
    }

    /// Closes every open connection as a network failure would.
    pub(crate) fn kill_connections(&self) {
        let killed: Vec<MemoryConnection> = {
            let mut state = self.state.lock().unwrap();
            for queue in state.queues.values_mut() {
                queue.consumers.clear();
            }
            state.connections.drain().map(|(_, c)| c).collect()
        };

        for conn in killed {
            conn.open.store(false, Ordering::SeqCst);
            conn.listener.notify("connection reset by peer");
        }
    }

    /// Cancels every consumer while leaving the connections open.
    pub(crate) fn cancel_consumers(&self) {
        let mut state = self.state.lock().unwrap();
        for queue in state.queues.values_mut() {
            queue.consumers.clear();
        }
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn open_connections(&self) -> usize {
        self.state.lock().unwrap().connections.len()
    }

    pub(crate) fn prefetch(&self) -> Option<u16> {
        self.state.lock().unwrap().prefetch
    }

    pub(crate) fn has_queue(&self, name: &str) -> bool {
        self.state.lock().unwrap().queues.contains_key(name)
    }

    pub(crate) fn is_bound(&self, queue: &str, exchange: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .bindings
            .iter()
            .any(|(q, e, _)| q == queue && e == exchange)
    }

    /// Messages waiting in `queue` for a consumer.
    pub(crate) fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(queue)
            .map(|q| q.buffer.len())
            .unwrap_or_default()
    }
}

impl Inner {
    fn route(&self, state: &mut State, msg: Stored) -> Result<(), AmqpError> {
        let targets: Vec<String> = if msg.exchange.is_empty() {
            vec![msg.routing_key.clone()]
        } else {
            let kind = state
                .exchanges
                .get(&msg.exchange)
                .ok_or_else(|| {
                    AmqpError::PublishingError(format!("no exchange {}", msg.exchange))
                })?;

            state
                .bindings
                .iter()
                .filter(|(_, e, key)| {
                    e == &msg.exchange
                        && (*kind == ExchangeKind::Fanout || key == &msg.routing_key)
                })
                .map(|(q, _, _)| q.clone())
                .collect()
        };

        for name in targets {
            let Some(queue) = state.queues.get_mut(&name) else {
                continue;
            };
            let stored = Stored {
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                properties: msg.properties.clone(),
                data: msg.data.clone(),
            };
            self.deliver(queue, stored);
        }

        Ok(())
    }

    fn deliver(&self, queue: &mut MemoryQueue, msg: Stored) {
        while let Some((_, consumer)) = queue.consumers.first() {
            let delivery = Delivery::new(
                self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
                &msg.exchange,
                &msg.routing_key,
                msg.properties.clone(),
                msg.data.clone(),
                Arc::new(MemoryAcker),
            );
            if consumer.send(Ok(delivery)).is_ok() {
                return;
            }
            queue.consumers.remove(0);
        }

        queue.buffer.push_back(msg);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        _uri: &str,
        _connection_name: &str,
        listener: CloseListener,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let open = Arc::new(AtomicBool::new(true));

        self.state.lock().unwrap().connections.insert(
            id,
            MemoryConnection {
                listener,
                open: open.clone(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            broker: self.inner.clone(),
            id,
            open,
        }))
    }
}

struct MemoryChannel {
    broker: Arc<Inner>,
    id: u64,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        if self.broker.reject_qos.load(Ordering::SeqCst) {
            return Err(AmqpError::QoSDeclarationError("not allowed".to_owned()));
        }

        self.broker.state.lock().unwrap().prefetch = Some(prefetch_count);
        Ok(())
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let delay = self.broker.declare_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut state = self.broker.state.lock().unwrap();

        match state.exchanges.get(&def.name) {
            Some(kind) if kind != &def.kind => {
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => {
                state.exchanges.insert(def.name.clone(), def.kind.clone());
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .unwrap()
            .queues
            .entry(def.name.clone())
            .or_default();
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock().unwrap();

        if !state.exchanges.contains_key(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }

        let entry = (
            binding.queue_name.clone(),
            binding.exchange_name.clone(),
            binding.routing_key.clone(),
        );
        if !state.bindings.contains(&entry) {
            state.bindings.push(entry);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()
            .map_err(|err| AmqpError::PublishingError(err.to_string()))?;

        let mut state = self.broker.state.lock().unwrap();
        self.broker.route(
            &mut state,
            Stored {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                properties,
                data: payload.to_vec(),
            },
        )
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()
            .map_err(|_| AmqpError::ConsumerDeclarationError(queue.to_owned()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.state.lock().unwrap();
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
            };

            q.consumers.push((self.id, tx));
            let buffered: Vec<Stored> = q.buffer.drain(..).collect();
            for msg in buffered {
                self.broker.deliver(q, msg);
            }
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);

        let mut state = self.broker.state.lock().unwrap();
        state.connections.remove(&self.id);
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|(id, _)| *id != self.id);
        }
        Ok(())
    }
}

struct MemoryAcker;

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}
