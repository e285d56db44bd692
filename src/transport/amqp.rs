// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Transport
//!
//! Broker capability implemented with lapin. Connections are established from a
//! [`RabbitMQConfig`]; channels map the wrapper's topology definitions and
//! message properties onto lapin's types.

use super::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, MessageProperties};
use crate::{
    config::RabbitMQConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ with lapin.
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    /// A broker connecting with lapin on the tokio runtime.
    pub fn new() -> Arc<AmqpBroker> {
        Arc::new(AmqpBroker)
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        config: &RabbitMQConfig,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(config.connection_name.clone()));

        let conn = match Connection::connect(&config.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), host = %config.host, "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(AmqpConnection { inner: conn }))
    }
}

/// A lapin connection.
pub struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel { inner: c }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the connection");
                AmqpError::CloseError("connection".to_owned())
            })
    }
}

/// A lapin channel.
pub struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                def.name(),
                def.exchange_kind(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(def.name().to_owned())
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        match self
            .inner
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name(), "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name().to_owned()))
            }
            Ok(queue) => Ok(queue.name().as_str().to_owned()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                binding.queue(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name().to_owned(),
                    binding.queue().to_owned(),
                )
            })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        match self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                to_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| {
                result
                    .map(|delivery| from_lapin_delivery(&delivery))
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, AmqpError> {
        match self
            .inner
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to get message");
                Err(AmqpError::GetMessageError(queue.to_owned()))
            }
            Ok(msg) => Ok(msg.map(|msg| from_lapin_delivery(&msg.delivery))),
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to close the channel");
                AmqpError::CloseError("channel".to_owned())
            })
    }
}

fn to_basic_properties(props: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();

    if let Some(content_type) = props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type));
    }
    if let Some(message_id) = props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id));
    }
    if let Some(correlation_id) = props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id));
    }
    if let Some(reply_to) = props.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to));
    }
    if props.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .into_iter()
        .map(|(key, value)| {
            (
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            )
        })
        .collect();

    basic.with_headers(FieldTable::from(headers))
}

fn from_lapin_delivery(delivery: &lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;

    let headers = match props.headers() {
        Some(table) => table
            .inner()
            .iter()
            .filter_map(|(key, value)| match value {
                AMQPValue::LongString(v) => Some((
                    key.as_str().to_owned(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )),
                AMQPValue::ShortString(v) => Some((key.as_str().to_owned(), v.as_str().to_owned())),
                _ => None,
            })
            .collect(),
        None => BTreeMap::default(),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: MessageProperties {
            content_type: props.content_type().as_ref().map(|v| v.as_str().to_owned()),
            message_id: props.message_id().as_ref().map(|v| v.as_str().to_owned()),
            correlation_id: props.correlation_id().as_ref().map(|v| v.as_str().to_owned()),
            reply_to: props.reply_to().as_ref().map(|v| v.as_str().to_owned()),
            persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
            headers,
        },
        body: delivery.data.clone(),
    }
}
