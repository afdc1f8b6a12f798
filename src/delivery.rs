// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages In and Out
//!
//! `Delivery` is one message handed from the broker to the consumer.
//! `OutboundMessage` is one message handed from the publisher to the broker.
//! Payloads are opaque bytes at this layer; JSON helpers sit on top.

use crate::errors::AmqpError;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message delivered from the broker.
///
/// Deliveries are auto-acknowledged by the transport, so the tag and the
/// redelivered flag are informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}

impl Delivery {
    /// Decodes the payload as JSON.
    ///
    /// # Returns
    /// The decoded value or `AmqpError::ParsePayloadError`
    pub fn json<T>(&self) -> Result<T, AmqpError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.data)
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
    }
}

/// A message ready to be handed to the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
    pub data: Vec<u8>,
}
