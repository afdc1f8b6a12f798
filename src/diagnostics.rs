// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dispatch Diagnostics
//!
//! Per-message failures of the dispatch loop are reported here and nowhere
//! else. They never stop the loop and never reach `publish` or `subscribe`
//! callers.

use tracing::{error, warn};

/// A per-message event reported by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// No handler is registered for the routing key; the message was dropped
    UnroutedKey {
        routing_key: String,
        exchange: String,
    },

    /// The handler returned an error or panicked
    DispatchFailure { routing_key: String, error: String },
}

/// Receiver of dispatch diagnostics.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, diagnostic: Diagnostic);
}

/// Default sink, writes diagnostics as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticSink for TracingDiagnostics {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::UnroutedKey {
                routing_key,
                exchange,
            } => warn!(
                routing_key,
                exchange, "removing message from queue - reason: no handler for routing key"
            ),
            Diagnostic::DispatchFailure { routing_key, error } => {
                error!(routing_key, error, "handler failure")
            }
        }
    }
}
