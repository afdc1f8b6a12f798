// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! A handler receives one delivery at a time. Handlers for the same routing
//! key may run concurrently; a handler that needs per-key ordering must lock
//! on its own.

use crate::{delivery::Delivery, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, sync::Arc};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes one delivery. An error is reported as a dispatch failure; it
    /// never causes a redelivery.
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`MessageHandler`].
///
/// The closure gets the delivery's trace context and an owned copy of the
/// delivery.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), delivery.clone()).await
    }
}

/// Wraps an async closure as a shareable handler.
///
/// # Parameters
/// * `f` - Closure called with the trace context and the delivery
///
/// # Returns
/// The handler, ready to be passed to `MessageQueue::subscribe`
///
/// ```ignore
/// let handler = handler_fn(|_ctx, delivery: Delivery| async move {
///     let order: Order = delivery.json()?;
///     println!("{}", order.id);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
