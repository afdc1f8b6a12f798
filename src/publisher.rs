// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module hands messages to the transport. Every message is tagged as
//! JSON, gets a fresh message id, and carries the caller's OpenTelemetry
//! context in its headers.
//!
//! Publishing is fire-and-forget: one transport call, no retry, and the
//! message is not marked mandatory, so the broker drops it silently when no
//! queue is bound for the routing key. An empty routing key is passed through
//! as is; it reaches only queues bound with the empty key.

use crate::{
    delivery::{OutboundMessage, JSON_CONTENT_TYPE},
    errors::AmqpError,
    otel,
    transport::Transport,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Publishes already-encoded payloads to any exchange.
pub struct Publisher {
    transport: Arc<dyn Transport>,
}

impl Publisher {
    /// Creates a publisher sending through the given transport.
    pub fn new(transport: Arc<dyn Transport>) -> Publisher {
        Publisher { transport }
    }

    /// Publishes a payload to the exchange under the routing key.
    ///
    /// # Returns
    /// Ok(()) once the transport accepted the message, or
    /// `AmqpError::PublishingError` wrapping the transport failure
    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::new();
        otel::inject(ctx, &mut headers);

        let msg = OutboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            content_type: JSON_CONTENT_TYPE.to_owned(),
            message_id: Uuid::new_v4().to_string(),
            headers,
            data: payload.to_vec(),
        };

        debug!(exchange, routing_key, "publishing message");

        match self.transport.publish(&msg).await {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(exchange.to_owned(), err))
            }
            _ => Ok(()),
        }
    }

    /// Encodes the message as JSON and publishes it.
    pub async fn publish_json<T>(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), "error serializing message");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        self.publish(ctx, exchange, routing_key, &payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{errors::TransportError, transport::MockTransport};
    use serde::Serialize;

    #[derive(Serialize)]
    struct Order {
        id: u32,
    }

    #[tokio::test]
    async fn publishes_json_with_metadata() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| {
                msg.exchange == "orders-exchange"
                    && msg.routing_key == "created"
                    && msg.content_type == "application/json"
                    && msg.data == br#"{"id":1}"#
                    && Uuid::parse_str(&msg.message_id).is_ok()
            })
            .times(1)
            .returning(|_| Ok(()));

        let publisher = Publisher::new(Arc::new(transport));
        publisher
            .publish_json(&Context::new(), "orders-exchange", "created", &Order { id: 1 })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_routing_key_is_passed_through() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .withf(|msg| msg.routing_key.is_empty())
            .times(1)
            .returning(|_| Ok(()));

        let publisher = Publisher::new(Arc::new(transport));
        publisher
            .publish(&Context::new(), "orders-exchange", "", b"{}")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn transport_failure_is_not_retried() {
        let mut transport = MockTransport::new();
        transport
            .expect_publish()
            .times(1)
            .returning(|_| Err(TransportError::Closed));

        let publisher = Publisher::new(Arc::new(transport));
        let err = publisher
            .publish(&Context::new(), "orders-exchange", "created", b"{}")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AmqpError::PublishingError("orders-exchange".to_owned(), TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn each_message_gets_its_own_id() {
        let ids = Arc::new(std::sync::Mutex::new(vec![]));
        let seen = ids.clone();

        let mut transport = MockTransport::new();
        transport.expect_publish().times(2).returning(move |msg| {
            seen.lock().unwrap().push(msg.message_id.clone());
            Ok(())
        });

        let publisher = Publisher::new(Arc::new(transport));
        for _ in 0..2 {
            publisher
                .publish(&Context::new(), "orders-exchange", "created", b"{}")
                .await
                .unwrap();
        }

        let ids = ids.lock().unwrap();
        assert_ne!(ids[0], ids[1]);
    }
}
