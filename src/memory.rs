// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Process Broker
//!
//! A broker that lives inside the process and speaks the [`Transport`]
//! contract. It follows the broker rules the message queue relies on:
//! idempotent declarations, exclusive queues tied to one connection, bindings
//! that require both ends to exist, and silent drops of unroutable messages.
//!
//! Every [`MemoryBroker::connect`] call opens a new connection; several
//! message queue instances sharing one broker see each other's exchanges.

use crate::{
    delivery::{Delivery, OutboundMessage},
    errors::TransportError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{QueueBinding, QueueDefinition},
    transport::{DeliveryStream, Transport},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

/// Name of the broker's default exchange, which routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Shared in-process broker state. Cloning yields another handle to the
/// same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    next_connection: u64,
    next_tag: u64,
}

struct MemoryQueue {
    def: QueueDefinition,
    owner: Option<u64>,
    bindings: BTreeSet<(String, String)>,
    pending: VecDeque<Delivery>,
    consumers: Vec<(u64, String, UnboundedSender<Delivery>)>,
    cursor: usize,
}

impl MemoryQueue {
    fn locked_for(&self, connection: u64) -> bool {
        matches!(self.owner, Some(owner) if owner != connection)
    }

    /// Hands the delivery to the next live consumer, or parks it.
    fn push(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let idx = self.cursor % self.consumers.len();
            match self.consumers[idx].2.send(delivery) {
                Ok(()) => {
                    self.cursor = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(idx);
                    delivery = returned;
                }
            }
        }
        self.pending.push_back(delivery);
    }
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    /// Opens a new connection to the broker.
    pub fn connect(&self) -> MemoryTransport {
        let mut state = self.lock();
        state.next_connection += 1;
        MemoryTransport {
            broker: self.clone(),
            id: state.next_connection,
            closed: AtomicBool::new(false),
        }
    }

    /// Whether an exchange with this name was declared.
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// The attributes the exchange was first declared with.
    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.lock().exchanges.get(name).cloned()
    }

    /// Whether the queue exists; exclusive queues vanish with their connection.
    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.lock().queues.get(name).map(|q| q.def.clone())
    }

    /// Bindings of the queue, ordered by exchange then routing key.
    pub fn bindings(&self, queue: &str) -> Vec<QueueBinding> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| {
                q.bindings
                    .iter()
                    .map(|(exchange, key)| {
                        QueueBinding::new(queue).exchange(exchange).routing_key(key)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of messages parked in the queue waiting for a consumer.
    pub fn pending(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.pending.len())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One connection (with its single channel) to a [`MemoryBroker`].
///
/// Closing or dropping it deletes the exclusive queues it owns and ends its
/// delivery streams.
pub struct MemoryTransport {
    broker: MemoryBroker,
    id: u64,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(self.broker.lock())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = self.broker.lock();
        let id = self.id;
        state.queues.retain(|name, queue| {
            if queue.owner == Some(id) {
                debug!(queue = name.as_str(), "deleting exclusive queue");
                return false;
            }
            let before = queue.consumers.len();
            queue.consumers.retain(|(owner, _, _)| *owner != id);
            !(queue.def.delete && before > 0 && queue.consumers.is_empty())
        });
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        let mut state = self.open_state()?;

        if def.name.is_empty() || def.name.starts_with("amq.") {
            return Err(TransportError::Broker(format!(
                "exchange name `{}` is reserved",
                def.name
            )));
        }

        match state.exchanges.get(&def.name) {
            Some(existing) if existing.same_attributes(def) => Ok(()),
            Some(existing) => Err(TransportError::PreconditionFailed(format!(
                "inequivalent arguments for exchange `{}`: declared {} durable={}, requested {} durable={}",
                def.name, existing.kind, existing.durable, def.kind, def.durable
            ))),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, TransportError> {
        let mut state = self.open_state()?;

        let name = if def.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            def.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.locked_for(self.id) {
                return Err(TransportError::ResourceLocked(format!(
                    "queue `{}` is exclusive to another connection",
                    name
                )));
            }
            if !existing.def.same_attributes(def) {
                return Err(TransportError::PreconditionFailed(format!(
                    "inequivalent arguments for queue `{}`",
                    name
                )));
            }
            return Ok(name);
        }

        let mut stored = def.clone();
        stored.name = name.clone();
        state.queues.insert(
            name.clone(),
            MemoryQueue {
                def: stored,
                owner: def.exclusive.then_some(self.id),
                bindings: BTreeSet::new(),
                pending: VecDeque::new(),
                consumers: vec![],
                cursor: 0,
            },
        );

        Ok(name)
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        let mut state = self.open_state()?;

        if !state.exchanges.contains_key(&binding.exchange_name) {
            return Err(TransportError::NotFound(format!(
                "no exchange `{}`",
                binding.exchange_name
            )));
        }

        let id = self.id;
        let Some(queue) = state.queues.get_mut(&binding.queue_name) else {
            return Err(TransportError::NotFound(format!(
                "no queue `{}`",
                binding.queue_name
            )));
        };

        if queue.locked_for(id) {
            return Err(TransportError::ResourceLocked(format!(
                "queue `{}` is exclusive to another connection",
                binding.queue_name
            )));
        }

        queue.bindings.insert((
            binding.exchange_name.clone(),
            binding.routing_key.clone(),
        ));
        Ok(())
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), TransportError> {
        let mut state = self.open_state()?;

        let targets: Vec<String> = if msg.exchange == DEFAULT_EXCHANGE {
            state
                .queues
                .contains_key(&msg.routing_key)
                .then(|| msg.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let Some(exchange) = state.exchanges.get(&msg.exchange) else {
                return Err(TransportError::NotFound(format!(
                    "no exchange `{}`",
                    msg.exchange
                )));
            };
            let kind = exchange.kind;

            state
                .queues
                .iter()
                .filter(|(_, queue)| {
                    queue.bindings.iter().any(|(exchange, key)| {
                        exchange == &msg.exchange && routes(kind, key, &msg.routing_key)
                    })
                })
                .map(|(name, _)| name.clone())
                .collect()
        };

        if targets.is_empty() {
            debug!(
                exchange = msg.exchange.as_str(),
                routing_key = msg.routing_key.as_str(),
                "message was not routed to any queue"
            );
            return Ok(());
        }

        for name in targets {
            state.next_tag += 1;
            let delivery = Delivery {
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                delivery_tag: state.next_tag,
                redelivered: false,
                content_type: Some(msg.content_type.clone()),
                message_id: Some(msg.message_id.clone()),
                headers: msg.headers.clone(),
                data: msg.data.clone(),
            };

            if let Some(queue) = state.queues.get_mut(&name) {
                queue.push(delivery);
            }
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let mut state = self.open_state()?;

        let Some(target) = state.queues.get_mut(queue) else {
            return Err(TransportError::NotFound(format!("no queue `{}`", queue)));
        };

        if target.locked_for(self.id) {
            return Err(TransportError::ResourceLocked(format!(
                "queue `{}` is exclusive to another connection",
                queue
            )));
        }

        debug!(queue, consumer_tag, "registering consumer");

        let (tx, rx) = mpsc::unbounded_channel();
        target.consumers.push((self.id, consumer_tag.to_owned(), tx));
        while let Some(delivery) = target.pending.pop_front() {
            target.push(delivery);
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        })
        .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.open_state()?;
        let id = self.id;

        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|(owner, tag, _)| !(*owner == id && tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.shutdown();
        Ok(())
    }
}

/// Whether a binding key accepts a routing key for the given exchange type.
fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            topic_matches(&pattern[1..], words)
                || (!words.is_empty() && topic_matches(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_matches(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_matches(&pattern[1..], &words[1..]),
        _ => false,
    }
}
