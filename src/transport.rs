// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # lapin Transport
//!
//! Implements the `client` capability traits with lapin. This is the only
//! module that touches lapin types: argument tables are converted to
//! `FieldTable` here, and lapin errors are classified into `AmqpError`.

use crate::{
    arguments::{Arguments, FieldValue},
    client::{
        AmqpChannel, AmqpConnection, AmqpConnector, ConsumeOptions, DeliveryStream,
        ExchangeDeclareOptions, QueueDeclareOk, QueueDeclareOptions,
    },
    connection::ConnectionConfig,
    consumer::Delivery,
    errors::AmqpError,
    exchange::ExchangeKind,
    publisher::Message,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions, QueueBindOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

const REPLY_SUCCESS: u16 = 200;

/// Persistent delivery mode of the basic properties.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Classifies a lapin failure into the crate's taxonomy.
fn classify(err: lapin::Error) -> AmqpError {
    match &err {
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            AmqpError::ConnectionError(err.to_string())
        }
        _ => AmqpError::ChannelError(err.to_string()),
    }
}

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    app_name: Option<String>,
}

impl LapinConnector {
    /// Connections are reported to the broker as `<app_name>:<connection name>`.
    pub fn new(app_name: &str) -> Self {
        LapinConnector {
            app_name: Some(app_name.to_owned()),
        }
    }

    fn uri(config: &ConnectionConfig) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: config.login.clone(),
                    password: config.password.clone(),
                },
                host: config.host.clone(),
                port: config.port,
            },
            vhost: config.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(config.heartbeat),
                connection_timeout: Some(
                    u64::try_from(config.connect_timeout.as_millis()).unwrap_or(u64::MAX),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!(connection = config.name, "creating amqp connection...");

        let connection_name = match &self.app_name {
            Some(app) => format!("{}:{}", app, config.name),
            None => config.name.clone(),
        };
        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(connection_name));

        match Connection::connect_uri(Self::uri(config), options).await {
            Ok(conn) => {
                debug!(connection = config.name, "amqp connected");
                Ok(Arc::new(LapinConnection { inner: conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), connection = config.name, "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        match self.inner.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(LapinChannel { inner: channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(classify(err))
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close(REPLY_SUCCESS, "OK").await.map_err(classify)
    }
}

struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(classify)
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.inner
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(classify)
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: Arguments,
    ) -> Result<(), AmqpError> {
        self.inner
            .exchange_declare(
                name,
                kind.into(),
                lapin::options::ExchangeDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: options.no_wait,
                },
                field_table(&arguments),
            )
            .await
            .map_err(classify)
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: Arguments,
    ) -> Result<QueueDeclareOk, AmqpError> {
        let queue = self
            .inner
            .queue_declare(
                name,
                lapin::options::QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: options.no_wait,
                },
                field_table(&arguments),
            )
            .await
            .map_err(classify)?;

        Ok(QueueDeclareOk {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.inner
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(classify)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), AmqpError> {
        let mut properties = BasicProperties::default()
            .with_message_id(ShortString::from(
                message
                    .message_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ))
            .with_headers(field_table(&message.headers));

        if let Some(content_type) = message.content_type {
            properties = properties.with_content_type(ShortString::from(content_type));
        }
        if let Some(kind) = message.kind {
            properties = properties.with_type(ShortString::from(kind));
        }
        if message.persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        // The returned confirm is collected by `wait_for_confirms` when confirms are enabled.
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn wait_for_confirms(&self) -> Result<(), AmqpError> {
        let returned = self.inner.wait_for_confirms().await.map_err(classify)?;
        if returned.is_empty() {
            return Ok(());
        }

        Err(AmqpError::ChannelError(format!(
            "{} message(s) returned by the broker",
            returned.len()
        )))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: Arguments,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: options.no_local,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: options.no_wait,
                },
                field_table(&arguments),
            )
            .await
            .map_err(classify)?;

        Ok(consumer
            .map(|result| result.map(delivery).map_err(classify))
            .boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(classify)
    }

    async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(classify)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close(REPLY_SUCCESS, "OK").await.map_err(classify)
    }
}

fn delivery(inbound: lapin::message::Delivery) -> Delivery {
    let props = &inbound.properties;

    Delivery {
        delivery_tag: inbound.delivery_tag,
        redelivered: inbound.redelivered,
        exchange: inbound.exchange.to_string(),
        routing_key: inbound.routing_key.to_string(),
        content_type: props.content_type().as_ref().map(ToString::to_string),
        kind: props.kind().as_ref().map(ToString::to_string),
        message_id: props.message_id().as_ref().map(ToString::to_string),
        headers: props.headers().as_ref().map(arguments).unwrap_or_default(),
        payload: inbound.data,
    }
}

pub(crate) fn field_table(args: &Arguments) -> FieldTable {
    let mut table = BTreeMap::new();
    for (key, value) in args {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    FieldTable::from(table)
}

fn amqp_value(value: &FieldValue) -> AMQPValue {
    match value {
        FieldValue::Bool(v) => AMQPValue::Boolean(*v),
        FieldValue::Int(v) => AMQPValue::LongLongInt(*v),
        FieldValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        FieldValue::Table(v) => AMQPValue::FieldTable(field_table(v)),
    }
}

pub(crate) fn arguments(table: &FieldTable) -> Arguments {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| field_value(value).map(|v| (key.to_string(), v)))
        .collect()
}

/// Values without a counterpart in `FieldValue` (floats, arrays, byte arrays) are skipped.
fn field_value(value: &AMQPValue) -> Option<FieldValue> {
    let converted = match value {
        AMQPValue::Boolean(v) => FieldValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => FieldValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => FieldValue::Int(*v),
        AMQPValue::ShortString(v) => FieldValue::String(v.to_string()),
        AMQPValue::LongString(v) => {
            FieldValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldTable(v) => FieldValue::Table(arguments(v)),
        _ => return None,
    };
    Some(converted)
}
