// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Protocol Client Capabilities
//!
//! The AMQP wire protocol is delegated to an external client. These traits
//! describe the subset of its surface the adapter relies on; `transport`
//! implements them on top of lapin.

use crate::{
    arguments::Arguments, connection::ConnectionConfig, consumer::Delivery, errors::AmqpError,
    exchange::ExchangeKind, publisher::Message,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// Deliveries pushed by the broker for one consumer registration.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub no_wait: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeclareOptions {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub no_wait: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub no_wait: bool,
}

/// Broker answer to a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// Broker-visible name, generated by the broker for unnamed queues.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Opens transport connections.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A live transport connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A communication channel multiplexed on a connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), AmqpError>;

    async fn confirm_select(&self) -> Result<(), AmqpError>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: Arguments,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: Arguments,
    ) -> Result<QueueDeclareOk, AmqpError>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError>;

    async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), AmqpError>;

    /// Resolves once every pending publisher confirm of the channel has arrived.
    async fn wait_for_confirms(&self) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        arguments: Arguments,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
