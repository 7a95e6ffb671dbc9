// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Configuration-driven RabbitMQ topology provisioning, publishing and
//! consuming.

mod otel;
#[cfg(test)]
mod testing;

pub mod arguments;
pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod resolver;
pub mod topology;
pub mod transport;

pub use broker::AmqpBroker;
pub use config::{AmqpConfig, ListenerOptions};
pub use consumer::{ConsumeResult, Delivery};
pub use dispatcher::DeliveryHandler;
pub use errors::AmqpError;
pub use publisher::{Message, Publisher};
