// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Queue
//!
//! The entry point of the crate. A `MessageQueue` owns one connection, one
//! channel, its home exchange `<name>-exchange` and its home queue
//! `<name>-queue`.
//!
//! Publishing and subscribing are deliberately asymmetric: `publish` always
//! targets the home exchange, while `subscribe` may bind the home queue to any
//! exchange, including one owned by another instance. An instance speaks only
//! on its own topic but may listen to others'.
//!
//! ```ignore
//! let mq = MessageQueue::new(&MessageQueueConfig::from_env()?).await?;
//! mq.subscribe("created", "orders-exchange", handler_fn(|_ctx, delivery: Delivery| async move {
//!     let order: Order = delivery.json()?;
//!     Ok(())
//! }))
//! .await?;
//!
//! let cancel = CancellationToken::new();
//! mq.listen(cancel.clone()).await?;
//! ```

use crate::{
    channel::AmqpTransport,
    config::MessageQueueConfig,
    diagnostics::{DiagnosticSink, TracingDiagnostics},
    dispatcher::Dispatcher,
    errors::AmqpError,
    handler::MessageHandler,
    publisher::Publisher,
    queue::QueueBinding,
    registry::RoutingRegistry,
    topology::{home_exchange, home_queue, subscription_exchange, AmqpTopology, Topology},
    transport::Transport,
};
use opentelemetry::Context;
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A named participant on the broker.
///
/// Owns the connection, the home topology, the routing registry and the
/// dispatch settings. Shared behind an `Arc` when `listen` runs on its own
/// task while other tasks subscribe or publish.
pub struct MessageQueue {
    name: String,
    exchange_name: String,
    queue_name: String,
    transport: Arc<dyn Transport>,
    topology: AmqpTopology,
    publisher: Publisher,
    registry: Arc<RoutingRegistry>,
    diagnostics: Arc<dyn DiagnosticSink>,
    max_concurrent_handlers: Option<usize>,
    listening: AtomicBool,
}

impl MessageQueue {
    /// Connects to the broker and declares the home exchange and queue.
    ///
    /// # Returns
    /// The message queue, a connection error when the broker cannot be
    /// reached, or a topology error when a declaration fails
    pub async fn new(cfg: &MessageQueueConfig) -> Result<MessageQueue, AmqpError> {
        let transport = AmqpTransport::connect(cfg).await?;
        MessageQueue::with_transport(&cfg.name, Arc::new(transport)).await
    }

    /// Builds a message queue over an already open transport and declares
    /// the home exchange and queue on it.
    ///
    /// The transport is closed when the declarations fail.
    ///
    /// # Parameters
    /// * `name` - Instance name, prefix of the home exchange and queue
    /// * `transport` - Open connection to the broker
    ///
    /// # Returns
    /// The message queue, `AmqpError::InvalidConfig` for an empty name, or a
    /// topology error when a declaration fails
    pub async fn with_transport(
        name: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<MessageQueue, AmqpError> {
        if name.is_empty() {
            return Err(AmqpError::InvalidConfig("name is required".to_owned()));
        }

        let exchange = home_exchange(name);
        let queue = home_queue(name);
        let exchange_name = exchange.name().to_owned();
        let queue_name = queue.name().to_owned();

        let topology = AmqpTopology::new(transport.clone())
            .exchange(exchange)
            .queue(queue);

        if let Err(err) = topology.install().await {
            if let Err(close_err) = transport.close().await {
                warn!(error = close_err.to_string(), "failure to close transport");
            }
            return Err(err);
        }

        debug!(
            exchange = exchange_name.as_str(),
            queue = queue_name.as_str(),
            "home topology declared"
        );

        Ok(MessageQueue {
            name: name.to_owned(),
            exchange_name,
            queue_name,
            publisher: Publisher::new(transport.clone()),
            transport,
            topology,
            registry: Arc::new(RoutingRegistry::new()),
            diagnostics: Arc::new(TracingDiagnostics),
            max_concurrent_handlers: None,
            listening: AtomicBool::new(false),
        })
    }

    /// Replaces the sink receiving unrouted-key and handler-failure reports.
    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Caps how many handlers run at the same time. Unbounded by default.
    pub fn with_max_concurrent_handlers(mut self, max: usize) -> Self {
        self.max_concurrent_handlers = Some(max);
        self
    }

    /// The instance name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the home exchange, `<name>-exchange`.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Name of the home queue, `<name>-queue`.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Routes messages published on `exchange` under `routing_key` to `handler`.
    ///
    /// The exchange is declared first as a durable direct exchange, so a
    /// foreign exchange that does not exist yet is created. A later
    /// subscription to the same routing key replaces the handler, whatever the
    /// exchange. May be called while `listen` runs.
    ///
    /// # Parameters
    /// * `routing_key` - Key the home queue is bound with
    /// * `exchange` - Exchange to bind to, home or foreign
    /// * `handler` - Handler run for every delivery carrying `routing_key`
    ///
    /// # Returns
    /// Ok(()) once bound and registered, or the topology error; nothing is
    /// registered when the declaration or the binding fails
    pub async fn subscribe(
        &self,
        routing_key: &str,
        exchange: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        self.topology
            .declare_exchange(&subscription_exchange(exchange))
            .await?;

        let binding = QueueBinding::new(&self.queue_name)
            .exchange(exchange)
            .routing_key(routing_key);
        self.topology.bind_queue(&binding).await?;

        self.registry.register(routing_key, handler);
        debug!(routing_key, exchange, "subscribed");

        Ok(())
    }

    /// Publishes an encoded payload on the home exchange.
    ///
    /// # Parameters
    /// * `ctx` - Trace context carried in the message headers
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Already encoded JSON body
    ///
    /// # Returns
    /// Ok(()) once handed to the broker, or `AmqpError::PublishingError`
    pub async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        self.publisher
            .publish(ctx, &self.exchange_name, routing_key, payload)
            .await
    }

    /// Encodes the message as JSON and publishes it on the home exchange.
    pub async fn publish_json<T>(
        &self,
        ctx: &Context,
        routing_key: &str,
        message: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher
            .publish_json(ctx, &self.exchange_name, routing_key, message)
            .await
    }

    /// Consumes the home queue and dispatches every delivery to its handler.
    ///
    /// Messages are acknowledged on delivery, before the handler runs; a
    /// failing handler never causes a redelivery. Only one `listen` may run
    /// at a time.
    ///
    /// # Returns
    /// Ok(()) after `cancel` fires, with the connection left open. An error
    /// when the consumer cannot be started or the delivery stream ends.
    pub async fn listen(&self, cancel: CancellationToken) -> Result<(), AmqpError> {
        if self.listening.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyListening);
        }

        let _guard = ListenGuard(&self.listening);
        self.consume(cancel).await
    }

    /// Closes the connection. The home queue goes away with it and a running
    /// `listen` returns with `AmqpError::StreamClosed`.
    pub async fn close(&self) -> Result<(), AmqpError> {
        match self.transport.close().await {
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, cancel: CancellationToken) -> Result<(), AmqpError> {
        let consumer_tag = format!("{}-{}", self.name, Uuid::new_v4());

        let deliveries = match self.transport.consume(&self.queue_name, &consumer_tag).await {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(
                    self.queue_name.clone(),
                    err,
                ))
            }
            Ok(c) => Ok(c),
        }?;
        debug!(queue = self.queue_name.as_str(), consumer_tag, "listening");

        let mut dispatcher = Dispatcher::new(self.registry.clone(), self.diagnostics.clone());
        if let Some(max) = self.max_concurrent_handlers {
            dispatcher = dispatcher.with_max_concurrent_handlers(max);
        }

        let result = dispatcher.run(deliveries, cancel).await;

        if result.is_ok() {
            if let Err(err) = self.transport.cancel(&consumer_tag).await {
                warn!(error = err.to_string(), "failure to cancel the consumer");
            }
        }

        result
    }
}

/// Clears the listening flag even when the `listen` future is dropped.
struct ListenGuard<'a>(&'a AtomicBool);

impl Drop for ListenGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
