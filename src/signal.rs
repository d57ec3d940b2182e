// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Failure Signal
//!
//! A single-producer, multi-consumer notification raised by the transport when
//! the connection or channel is closed by the broker or the network.
//!
//! The signal is level-triggered: the state is an explicit `pending` flag, and
//! waking up only tells a waiter to look at it. Consumers of the signal must
//! [`take`](FailureSignal::take) it before reconnecting, so that two observers
//! (the publisher and the consumer loop) never both act on the same failure and
//! neither misses it because the other woke first.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Notify;
use tracing::warn;

/// Level-triggered failure notification.
#[derive(Debug, Default)]
pub struct FailureSignal {
    pending: AtomicBool,
    notify: Notify,
}

impl FailureSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a failure as pending and wakes every waiter. Never blocks, even
    /// when nobody is listening.
    pub fn raise(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns whether a failure is pending without draining it.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Drains the pending failure. Returns `true` only for the caller that
    /// observed the transition, which then owns the recovery.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    /// Waits until a failure is pending. Returns immediately when one already is.
    /// Does not drain the signal.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_pending() {
                return;
            }

            notified.await;
        }
    }
}

/// Arming token registered with the transport of one broker session.
///
/// The listener raises the shared [`FailureSignal`] at most once; once the
/// session it belongs to is retired it is disarmed and late close events from
/// the old connection are ignored.
#[derive(Debug, Clone)]
pub struct CloseListener {
    signal: Arc<FailureSignal>,
    armed: Arc<AtomicBool>,
}

impl CloseListener {
    pub fn new(signal: Arc<FailureSignal>) -> Self {
        CloseListener {
            signal,
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Called by the transport when the connection or channel is closed.
    pub fn notify(&self, reason: &str) {
        if self.armed.swap(false, Ordering::SeqCst) {
            warn!(reason = reason, "amqp session closed");
            self.signal.raise();
        }
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}
