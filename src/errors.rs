// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Message Queue
//!
//! This module provides the error types used across the crate. `TransportError`
//! is what a broker transport reports, `AmqpError` is what the public API
//! returns, and `HandlerError` is what a message handler may fail with.

use thiserror::Error;

/// Errors reported by a [`Transport`](crate::transport::Transport) implementation.
///
/// These mirror the broker-side failure classes that matter to the topology
/// and publishing layers; anything else is carried as `Broker`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// An entity was redeclared with attributes different from the existing one
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The exchange or queue referenced does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// The queue is exclusive to another connection
    #[error("resource locked: {0}")]
    ResourceLocked(String),

    /// The connection or channel is no longer open
    #[error("connection closed")]
    Closed,

    /// Any other client or broker failure
    #[error("broker error: {0}")]
    Broker(String),
}

/// Represents errors that can occur during message queue operations.
///
/// Variants fall into the setup classes (connection and topology), the
/// publishing class, and the terminal failures of the dispatch loop. Handler
/// failures never surface here; they are reported as diagnostics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The configuration is missing a required field
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`: {1}")]
    DeclareExchangeError(String, TransportError),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`: {1}")]
    DeclareQueueError(String, TransportError),

    /// Error binding an exchange to a queue
    #[error("failure to bind exchange `{0}` to queue `{1}`: {2}")]
    BindingExchangeToQueueError(String, String, TransportError),

    /// Error publishing a message
    #[error("failure to publish to `{0}`: {1}")]
    PublishingError(String, TransportError),

    /// Error encoding a payload as JSON
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload: {0}")]
    ParsePayloadError(String),

    /// Error declaring a consumer on the queue
    #[error("failure to declare consumer on `{0}`: {1}")]
    ConsumerDeclarationError(String, TransportError),

    /// The delivery stream ended, usually because the connection was lost
    #[error("delivery stream closed")]
    StreamClosed,

    /// The delivery stream reported a failure
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// `listen` was called while another `listen` is running
    #[error("already listening")]
    AlreadyListening,
}

impl AmqpError {
    /// Returns true for declaration and binding failures.
    pub fn is_topology_error(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(..)
                | AmqpError::DeclareQueueError(..)
                | AmqpError::BindingExchangeToQueueError(..)
        )
    }

    /// Returns true when the broker could not be reached or no channel opened.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_)
        )
    }
}

/// Error type returned by message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
