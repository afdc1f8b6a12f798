// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of the AMQP connection and channel, and
//! implements the [`Transport`] trait on top of them with lapin.

use crate::{
    config::MessageQueueConfig,
    delivery::{Delivery, OutboundMessage},
    errors::{AmqpError, TransportError},
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{DeliveryStream, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;
const NOT_FOUND: u16 = 404;
const RESOURCE_LOCKED: u16 = 405;
const PRECONDITION_FAILED: u16 = 406;

/// Lapin connection and channel pair used as the message queue transport.
pub struct AmqpTransport {
    conn: Connection,
    channel: Channel,
}

impl AmqpTransport {
    /// Connects to the broker and opens one channel.
    ///
    /// The connection is named after the configured instance name so it can
    /// be told apart in the broker's management tools.
    ///
    /// # Returns
    /// The transport, `AmqpError::ConnectionError` when the broker cannot be
    /// reached or refuses the credentials, or `AmqpError::ChannelError`.
    pub async fn connect(cfg: &MessageQueueConfig) -> Result<AmqpTransport, AmqpError> {
        cfg.validate()?;

        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.name.clone()));

        let conn = match Connection::connect(&cfg.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(AmqpTransport { conn, channel })
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        Ok(queue.name().as_str().to_owned())
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)
    }

    async fn publish(&self, msg: &OutboundMessage) -> Result<(), TransportError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        for (key, value) in &msg.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        self.channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.data,
                BasicProperties::default()
                    .with_content_type(ShortString::from(msg.content_type.clone()))
                    .with_message_id(ShortString::from(msg.message_id.clone()))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
            .map(|_| ())
            .map_err(transport_error)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport_error)?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery {
                    exchange: delivery.exchange.as_str().to_owned(),
                    routing_key: delivery.routing_key.as_str().to_owned(),
                    delivery_tag: delivery.delivery_tag,
                    redelivered: delivery.redelivered,
                    content_type: delivery
                        .properties
                        .content_type()
                        .as_ref()
                        .map(|v| v.as_str().to_owned()),
                    message_id: delivery
                        .properties
                        .message_id()
                        .as_ref()
                        .map(|v| v.as_str().to_owned()),
                    headers: string_headers(&delivery.properties),
                    data: delivery.data,
                }),
                Err(err) => Err(transport_error(err)),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(transport_error)
    }

    async fn close(&self) -> Result<(), TransportError> {
        debug!("closing amqp connection");
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(transport_error)
    }
}

/// Keeps the string-valued headers, which is where trace context travels.
fn string_headers(props: &AMQPProperties) -> BTreeMap<String, String> {
    let Some(table) = props.headers() else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| match value {
            AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
                .ok()
                .map(|s| (key.as_str().to_owned(), s.to_owned())),
            AMQPValue::ShortString(v) => Some((key.as_str().to_owned(), v.as_str().to_owned())),
            _ => None,
        })
        .collect()
}

fn transport_error(err: lapin::Error) -> TransportError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match u16::from(amqp.get_id()) {
            PRECONDITION_FAILED => TransportError::PreconditionFailed(err.to_string()),
            NOT_FOUND => TransportError::NotFound(err.to_string()),
            RESOURCE_LOCKED => TransportError::ResourceLocked(err.to_string()),
            _ => TransportError::Broker(err.to_string()),
        },
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::Closed
        }
        _ => TransportError::Broker(err.to_string()),
    }
}
