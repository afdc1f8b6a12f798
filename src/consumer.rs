// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! Runs one handler against one delivery. The delivery was acknowledged by
//! the transport before it got here, so the outcome only decides what is
//! recorded: the span status and, on failure, a `DispatchFailure` diagnostic.

use crate::{
    delivery::Delivery,
    diagnostics::{Diagnostic, DiagnosticSink},
    errors::AmqpError,
    handler::MessageHandler,
    otel,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::debug;

/// Executes the handler for a delivery.
///
/// The handler runs inside a consumer span whose parent is the trace context
/// carried by the delivery. A returned error or a panic is reported exactly
/// once to the diagnostic sink and goes no further.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: Delivery,
    handler: Arc<dyn MessageHandler>,
    diagnostics: Arc<dyn DiagnosticSink>,
) {
    let (ctx, mut span) = otel::new_span(&delivery, tracer);

    debug!(
        "received: {} - exchange: {}",
        delivery.routing_key, delivery.exchange,
    );

    let result = AssertUnwindSafe(handler.exec(&ctx, &delivery))
        .catch_unwind()
        .await;

    let failure = match result {
        Ok(Ok(())) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            return;
        }
        Ok(Err(err)) => err.to_string(),
        Err(panic) => panic_message(panic),
    };

    span.record_error(&AmqpError::ConsumerError(failure.clone()));
    span.set_status(Status::Error {
        description: Cow::from("handler failure"),
    });

    diagnostics.report(Diagnostic::DispatchFailure {
        routing_key: delivery.routing_key,
        error: failure,
    });
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", msg)
    } else {
        "handler panicked".to_owned()
    }
}
