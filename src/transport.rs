// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The capability set the message queue needs from a broker client. The lapin
//! implementation lives in [`channel`](crate::channel); an in-process broker
//! lives in [`memory`](crate::memory).

use crate::{
    delivery::{Delivery, OutboundMessage},
    errors::TransportError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Stream of deliveries for one consumer. It ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// One open channel on a broker connection.
///
/// Declarations follow broker semantics: redeclaring with identical
/// attributes is a no-op, redeclaring with different attributes fails with
/// `TransportError::PreconditionFailed`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError>;

    /// Declares a queue and returns its effective name.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, TransportError>;

    /// Binds a queue to an exchange. Both must already exist.
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TransportError>;

    /// Publishes without the mandatory and immediate flags; unroutable
    /// messages are dropped by the broker.
    async fn publish(&self, msg: &OutboundMessage) -> Result<(), TransportError>;

    /// Starts an auto-acknowledged consumer on the queue.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, TransportError>;

    /// Stops the consumer started with the given tag. Its stream ends.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    /// Closes the underlying connection. Open delivery streams end.
    async fn close(&self) -> Result<(), TransportError>;
}
