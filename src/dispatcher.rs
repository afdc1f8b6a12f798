// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! This module runs the dispatch loop: it reads deliveries from the consumer
//! stream, looks the routing key up in the registry and runs the handler on
//! its own task, so a slow or stuck handler never holds up the next read.
//!
//! Deliveries are dispatched in arrival order; handlers complete in any order.
//! A delivery with no handler is reported as `UnroutedKey` and dropped.

use crate::{
    consumer::consume,
    delivery::Delivery,
    diagnostics::{Diagnostic, DiagnosticSink},
    errors::AmqpError,
    registry::RoutingRegistry,
    transport::DeliveryStream,
};
use futures_util::StreamExt;
use opentelemetry::global::{self, BoxedTracer};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Dispatches deliveries to the handlers of a routing registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RoutingRegistry>,
    diagnostics: Arc<dyn DiagnosticSink>,
    limiter: Option<Arc<Semaphore>>,
    tracer: Arc<BoxedTracer>,
}

impl Dispatcher {
    /// Creates an unbounded dispatcher.
    ///
    /// # Parameters
    /// * `registry` - Handlers by routing key, read once per delivery
    /// * `diagnostics` - Receives unrouted-key and handler-failure reports
    pub fn new(registry: Arc<RoutingRegistry>, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Dispatcher {
            registry,
            diagnostics,
            limiter: None,
            tracer: Arc::new(global::tracer("amqp consumer")),
        }
    }

    /// Caps how many handlers run at the same time.
    ///
    /// Every delivery is still handed to its own task right away; the task
    /// waits for a free slot before running the handler, so the stream read is
    /// never blocked. Waiting tasks are not bounded.
    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(max.max(1))));
        self
    }

    /// Runs the dispatch loop until the stream ends or the token is cancelled.
    ///
    /// # Returns
    /// Ok(()) when cancelled, `AmqpError::StreamClosed` when the stream ends,
    /// or `AmqpError::ConsumerError` when the stream reports a failure
    pub async fn run(
        &self,
        mut deliveries: DeliveryStream,
        cancel: CancellationToken,
    ) -> Result<(), AmqpError> {
        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    debug!("dispatch loop cancelled");
                    return Ok(());
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => self.dispatch(delivery),
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "errors consume msg");
                        return Err(AmqpError::ConsumerError(err.to_string()));
                    }
                    None => {
                        error!("delivery stream closed");
                        return Err(AmqpError::StreamClosed);
                    }
                },
            }
        }
    }

    /// Routes one delivery. Returns as soon as the handler task is spawned.
    pub fn dispatch(&self, delivery: Delivery) {
        let Some(handler) = self.registry.lookup(&delivery.routing_key) else {
            self.diagnostics.report(Diagnostic::UnroutedKey {
                routing_key: delivery.routing_key,
                exchange: delivery.exchange,
            });
            return;
        };

        let tracer = self.tracer.clone();
        let diagnostics = self.diagnostics.clone();
        let limiter = self.limiter.clone();

        tokio::spawn(async move {
            let _permit = match limiter {
                Some(limiter) => limiter.acquire_owned().await.ok(),
                None => None,
            };

            consume(&tracer, delivery, handler, diagnostics).await;
        });
    }
}
