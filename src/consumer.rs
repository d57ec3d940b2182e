// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module runs caller-supplied handlers on deliveries. Each delivery
//! stream gets one worker that invokes the handler for every delivery in
//! arrival order. Every invocation runs in its own task, so a handler that
//! panics or fails is reported without taking the worker down with it.
//! Acknowledgment, when consuming without auto-ack, is left to the handler.

use crate::{errors::AmqpError, message::Delivery, otel};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, warn};

/// Processes deliveries from a consumer supervisor.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError>;
}

/// Spawns the worker that drains `deliveries` into `handler`. The worker ends
/// once the sending side is dropped and the buffered deliveries are handled.
pub(crate) fn spawn_worker(
    handler: Arc<dyn ConsumerHandler>,
    mut deliveries: mpsc::Receiver<Delivery>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            consume(handler.clone(), delivery).await;
        }
        debug!("consumer worker finished");
    })
}

/// Runs the handler on one delivery inside a supervised task.
pub(crate) async fn consume(handler: Arc<dyn ConsumerHandler>, delivery: Delivery) {
    let tag = delivery.delivery_tag;

    let invocation = tokio::spawn(async move {
        let msg_type = delivery.msg_type();
        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&delivery.headers(), &tracer, &msg_type);

        debug!(
            "received: {} - exchange: {}",
            msg_type, delivery.exchange,
        );

        let result = handler.exec(&ctx, &delivery).await;
        match &result {
            Ok(_) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        result
    });

    match invocation.await {
        Ok(Ok(())) => debug!(delivery_tag = tag, "message successfully processed"),
        Ok(Err(err)) => error!(
            error = err.to_string(),
            delivery_tag = tag,
            "error handling msg"
        ),
        Err(err) if err.is_panic() => error!(delivery_tag = tag, "handler panicked"),
        Err(_) => warn!(delivery_tag = tag, "handler task cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Acknowledger;
    use lapin::BasicProperties;
    use std::sync::Mutex;

    struct Ack;

    #[async_trait]
    impl Acknowledger for Ack {
        async fn ack(&self) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConsumerHandler for Recorder {
        async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), AmqpError> {
            let payload = String::from_utf8_lossy(&delivery.data).into_owned();
            if payload == "boom" {
                panic!("handler bug");
            }

            self.seen.lock().unwrap().push(payload.clone());
            if payload == "bad" {
                return Err(AmqpError::HandlerError("rejected".into()));
            }
            Ok(())
        }
    }

    fn delivery(tag: u64, payload: &str) -> Delivery {
        Delivery::new(
            tag,
            "orders",
            "",
            BasicProperties::default(),
            payload.as_bytes().to_vec(),
            Arc::new(Ack),
        )
    }

    #[tokio::test]
    async fn worker_keeps_order_and_survives_faults() {
        let recorder = Arc::new(Recorder::default());
        let (tx, rx) = mpsc::channel(8);
        let worker = spawn_worker(recorder.clone(), rx);

        for (tag, payload) in ["a", "boom", "bad", "b"].into_iter().enumerate() {
            tx.send(delivery(tag as u64, payload)).await.unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        assert_eq!(*recorder.seen.lock().unwrap(), vec!["a", "bad", "b"]);
    }
}
