// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod consumer;
mod otel;

pub mod channel;
pub mod config;
pub mod delivery;
pub mod diagnostics;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod memory;
pub mod message_queue;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod topology;
pub mod transport;

pub use config::MessageQueueConfig;
pub use delivery::Delivery;
pub use errors::{AmqpError, HandlerError};
pub use handler::{handler_fn, MessageHandler};
pub use message_queue::MessageQueue;
pub use tokio_util::sync::CancellationToken;
