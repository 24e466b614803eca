// Copyright (c) 2025, The Coworkers Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! This module defines the transport collaborator the lifecycle coordinator
//! drives: connection and channel management, queue assertion, consumer
//! attachment and the ack/nack/publish primitives. The production
//! implementation is [`LapinTransport`]; the trait is the seam tests mock.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error};

use crate::context::{Envelope, Message};
use crate::errors::Error;
use crate::queue::{ConsumeOptions, QueueOptions};

/// Queue argument for message TTL
const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Queue argument for maximum queue length
const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Callback invoked once per delivery.
///
/// The returned completion is awaited before the next delivery is taken
/// from the stream, so channel prefetch provides backpressure.
pub type DeliveryHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Properties attached to an outgoing publish.
#[derive(Debug, Clone, Default)]
pub struct PublishProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Interface to the broker, driven by the lifecycle coordinator.
///
/// Implementations own the wire protocol; the framework only sequences the
/// calls and stores the returned handles.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: Send + Sync + 'static;
    type Channel: Clone + Send + Sync + 'static;

    /// Opens a connection to the broker.
    async fn connect(&self, url: &str, connection_name: &str)
        -> Result<Self::Connection, Error>;

    /// Opens a channel on an established connection.
    async fn create_channel(&self, connection: &Self::Connection)
        -> Result<Self::Channel, Error>;

    /// Applies a per-channel prefetch.
    async fn set_prefetch(&self, channel: &Self::Channel, prefetch: u16) -> Result<(), Error>;

    /// Asserts a queue with the given options.
    async fn assert_queue(
        &self,
        channel: &Self::Channel,
        queue_name: &str,
        options: &QueueOptions,
    ) -> Result<(), Error>;

    /// Attaches a consumer that invokes `handler` once per delivery.
    ///
    /// # Returns
    /// The broker-issued consumer tag, used to cancel the consumer later
    async fn consume(
        &self,
        channel: &Self::Channel,
        queue_name: &str,
        options: &ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<String, Error>;

    /// Cancels a live consumer by tag.
    async fn cancel_consumer(&self, channel: &Self::Channel, consumer_tag: &str)
        -> Result<(), Error>;

    /// Publishes a message.
    async fn publish(
        &self,
        channel: &Self::Channel,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<(), Error>;

    /// Positively acknowledges a delivery.
    async fn ack(&self, channel: &Self::Channel, delivery_tag: u64) -> Result<(), Error>;

    /// Negatively acknowledges a delivery.
    async fn nack(
        &self,
        channel: &Self::Channel,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), Error>;

    /// Closes a channel.
    async fn close_channel(&self, channel: &Self::Channel) -> Result<(), Error>;

    /// Closes the connection.
    async fn close_connection(&self, connection: &Self::Connection) -> Result<(), Error>;
}

/// Production transport backed by lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> LapinTransport {
        LapinTransport
    }
}

#[async_trait]
impl Transport for LapinTransport {
    type Connection = Connection;
    type Channel = Channel;

    async fn connect(&self, url: &str, connection_name: &str) -> Result<Connection, Error> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        let connection = Connection::connect(url, options).await.map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            Error::transport("failure to connect", err)
        })?;
        debug!("amqp connected");

        Ok(connection)
    }

    async fn create_channel(&self, connection: &Connection) -> Result<Channel, Error> {
        debug!("creating amqp channel...");
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            Error::transport("failure to create a channel", err)
        })?;
        debug!("channel created");

        Ok(channel)
    }

    async fn set_prefetch(&self, channel: &Channel, prefetch: u16) -> Result<(), Error> {
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                Error::transport(format!("failure to configure qos `{prefetch}`"), err)
            })
    }

    async fn assert_queue(
        &self,
        channel: &Channel,
        queue_name: &str,
        options: &QueueOptions,
    ) -> Result<(), Error> {
        debug!("creating queue: {}", queue_name);

        let mut queue_args = BTreeMap::new();
        if let Some(ttl) = options.message_ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl as i32)),
            );
        }
        if let Some(max) = options.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max as i32)),
            );
        }

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.no_wait,
                },
                FieldTable::from(queue_args),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = queue_name,
                    "error to declare the queue"
                );
                Error::transport(format!("failure to declare queue `{queue_name}`"), err)
            })?;

        debug!("queue: {} was created", queue_name);
        Ok(())
    }

    async fn consume(
        &self,
        channel: &Channel,
        queue_name: &str,
        options: &ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<String, Error> {
        let mut consumer = channel
            .basic_consume(
                queue_name,
                "",
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                Error::transport(format!("failure to declare consumer `{queue_name}`"), err)
            })?;

        let tag = consumer.tag().to_string();
        let queue = queue_name.to_owned();

        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => handler(message_from_delivery(&delivery)).await,
                    Err(err) => {
                        error!(error = err.to_string(), queue = queue, "errors consume msg")
                    }
                }
            }
        });

        Ok(tag)
    }

    async fn cancel_consumer(&self, channel: &Channel, consumer_tag: &str) -> Result<(), Error> {
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to cancel the consumer");
                Error::transport(format!("failure to cancel consumer `{consumer_tag}`"), err)
            })
    }

    async fn publish(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<(), Error> {
        let mut props = BasicProperties::default();
        if let Some(content_type) = properties.content_type {
            props = props.with_content_type(ShortString::from(content_type));
        }
        if let Some(correlation_id) = properties.correlation_id {
            props = props.with_correlation_id(ShortString::from(correlation_id));
        }
        if let Some(message_id) = properties.message_id {
            props = props.with_message_id(ShortString::from(message_id));
        }
        if !properties.headers.is_empty() {
            let headers: BTreeMap<ShortString, AMQPValue> = properties
                .headers
                .into_iter()
                .map(|(key, value)| {
                    (
                        ShortString::from(key),
                        AMQPValue::LongString(LongString::from(value)),
                    )
                })
                .collect();
            props = props.with_headers(FieldTable::from(headers));
        }

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                props,
            )
            .await
            .map(|_confirm| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                Error::transport("failure to publish", err)
            })
    }

    async fn ack(&self, channel: &Channel, delivery_tag: u64) -> Result<(), Error> {
        channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                Error::transport("failure to ack message", err)
            })
    }

    async fn nack(&self, channel: &Channel, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                Error::transport("failure to nack message", err)
            })
    }

    async fn close_channel(&self, channel: &Channel) -> Result<(), Error> {
        channel.close(200, "closing").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the channel");
            Error::transport("failure to close channel", err)
        })
    }

    async fn close_connection(&self, connection: &Connection) -> Result<(), Error> {
        connection.close(200, "closing").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            Error::transport("failure to close connection", err)
        })
    }
}

/// Converts a lapin delivery into the framework message type.
fn message_from_delivery(delivery: &Delivery) -> Message {
    let properties = &delivery.properties;

    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(text) = value {
                headers.insert(
                    key.as_str().to_owned(),
                    String::from_utf8_lossy(text.as_bytes()).into_owned(),
                );
            }
        }
    }

    Message {
        payload: delivery.data.clone(),
        envelope: Envelope {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            reply_to: properties.reply_to().as_ref().map(|v| v.to_string()),
            correlation_id: properties.correlation_id().as_ref().map(|v| v.to_string()),
            content_type: properties.content_type().as_ref().map(|v| v.to_string()),
            headers,
        },
    }
}
