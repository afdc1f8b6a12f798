// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Routing Registry
//!
//! Maps routing keys to handlers. Written by `subscribe`, read once per
//! delivery by the dispatch loop; both may happen at the same time.

use crate::handler::MessageHandler;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Concurrency-safe routing key to handler map. At most one handler per key;
/// the last registration wins.
#[derive(Default)]
pub struct RoutingRegistry {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl RoutingRegistry {
    /// Creates an empty registry.
    pub fn new() -> RoutingRegistry {
        RoutingRegistry::default()
    }

    /// Registers the handler for the key, replacing any previous one.
    ///
    /// # Returns
    /// The handler that was replaced, if any
    pub fn register(
        &self,
        routing_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<Arc<dyn MessageHandler>> {
        let previous = self.handlers.insert(routing_key.to_owned(), handler);
        if previous.is_some() {
            debug!(routing_key, "replacing handler");
        }
        previous
    }

    /// Finds the handler for the key.
    ///
    /// # Returns
    /// A shared reference to the handler, or None when the key is unknown
    pub fn lookup(&self, routing_key: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .get(routing_key)
            .map(|entry| entry.value().clone())
    }

    /// Number of routing keys with a handler.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
