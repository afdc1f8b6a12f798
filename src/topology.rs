// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! This module declares exchanges and queues and binds them together. It also
//! derives the home topology of a message queue instance from its name:
//! the `<name>-exchange` durable direct exchange and the `<name>-queue`
//! exclusive queue.
//!
//! The main components are:
//! - `Topology` trait: builder interface that collects definitions and installs them
//! - `AmqpTopology`: implementation over a [`Transport`]
//! - `home_exchange`, `home_queue`, `subscription_exchange`: the definitions
//!   the message queue declares

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::Transport,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Suffix appended to the instance name to form its exchange name
pub const EXCHANGE_SUFFIX: &str = "-exchange";
/// Suffix appended to the instance name to form its queue name
pub const QUEUE_SUFFIX: &str = "-queue";

/// The exchange owned by the instance called `name`.
pub fn home_exchange(name: &str) -> ExchangeDefinition {
    ExchangeDefinition::new(&format!("{}{}", name, EXCHANGE_SUFFIX))
        .direct()
        .durable()
}

/// The queue owned by the instance called `name`. It lives as long as the
/// connection that declared it.
pub fn home_queue(name: &str) -> QueueDefinition {
    QueueDefinition::new(&format!("{}{}", name, QUEUE_SUFFIX)).exclusive()
}

/// The definition used when subscribing to an exchange, home or foreign.
///
/// It has the same attributes as a home exchange, so subscribing to another
/// instance's exchange redeclares it identically.
pub fn subscription_exchange(name: &str) -> ExchangeDefinition {
    ExchangeDefinition::new(name).direct().durable()
}

/// Trait defining the interface for topology management.
///
/// Definitions are collected with the builder methods and created on the
/// broker by `install`.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Creates all exchanges, then all queues, then all bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// Topology manager over a transport.
pub struct AmqpTopology {
    transport: Arc<dyn Transport>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl AmqpTopology {
    /// Creates an empty topology over the transport.
    ///
    /// # Parameters
    /// * `transport` - Connection the declarations are sent on
    pub fn new(transport: Arc<dyn Transport>) -> AmqpTopology {
        AmqpTopology {
            transport,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// Declares one exchange.
    ///
    /// Succeeds when the exchange already exists with the same attributes.
    ///
    /// # Returns
    /// Ok(()) or `AmqpError::DeclareExchangeError` on mismatch or transport failure
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self.transport.declare_exchange(def).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone(), err))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    /// Declares one queue.
    ///
    /// Succeeds when the queue already exists with the same attributes.
    ///
    /// # Returns
    /// The effective queue name or `AmqpError::DeclareQueueError`
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self.transport.declare_queue(def).await {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone(), err))
            }
            Ok(name) => {
                debug!("queue: {} was created", name);
                Ok(name)
            }
        }
    }

    /// Binds a queue to an exchange. The exchange must be declared first.
    ///
    /// # Returns
    /// Ok(()) or `AmqpError::BindingExchangeToQueueError`
    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        match self.transport.bind_queue(binding).await {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                    err,
                ))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.declare_exchange(exch).await?;
        }

        for queue in &self.queues {
            self.declare_queue(queue).await?;
        }

        for binding in &self.queues_binding {
            self.bind_queue(binding).await?;
        }

        Ok(())
    }
}
