// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration Maps
//!
//! Raw, already-validated configuration for connections, exchanges, queues and
//! listeners. Every field is optional: an entry is merged over the `defaults`
//! section, which is itself merged over the built-in defaults, by the registry
//! and resolver modules.

use crate::{arguments::Arguments, errors::AmqpError};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Name of the connection used by entities that do not name one.
pub const DEFAULT_CONNECTION: &str = "default";

/// Root of the configuration consumed by the broker facade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub connections: HashMap<String, ConnectionOptions>,
    pub exchanges: HashMap<String, ExchangeOptions>,
    pub queues: HashMap<String, QueueOptions>,
    pub defaults: Defaults,
}

impl AmqpConfig {
    /// Builds the configuration from an already-parsed JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, AmqpError> {
        serde_json::from_value(value).map_err(|err| AmqpError::InvalidConfig(err.to_string()))
    }

    /// Builds the configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, AmqpError> {
        serde_json::from_str(text).map_err(|err| AmqpError::InvalidConfig(err.to_string()))
    }
}

/// Overrides applied under every entry of the matching section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub connection: ConnectionOptions,
    pub exchange: ExchangeOptions,
    pub queue: QueueOptions,
    pub listener: ListenerOptions,
}

/// Raw settings of one logical broker connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub login: Option<String>,
    pub password: Option<String>,
    pub vhost: Option<String>,
    #[serde(deserialize_with = "seconds")]
    pub connect_timeout: Option<f64>,
    #[serde(deserialize_with = "seconds")]
    pub read_timeout: Option<f64>,
    #[serde(deserialize_with = "seconds")]
    pub write_timeout: Option<f64>,
    pub heartbeat: Option<u16>,
    pub prefetch_count: Option<u16>,
    pub publisher_confirms: Option<bool>,
    pub keepalive: Option<bool>,
}

impl ConnectionOptions {
    /// Fills every unset field from `defaults`.
    pub fn merged_over(&self, defaults: &ConnectionOptions) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone().or_else(|| defaults.host.clone()),
            port: self.port.or(defaults.port),
            login: self.login.clone().or_else(|| defaults.login.clone()),
            password: self.password.clone().or_else(|| defaults.password.clone()),
            vhost: self.vhost.clone().or_else(|| defaults.vhost.clone()),
            connect_timeout: self.connect_timeout.or(defaults.connect_timeout),
            read_timeout: self.read_timeout.or(defaults.read_timeout),
            write_timeout: self.write_timeout.or(defaults.write_timeout),
            heartbeat: self.heartbeat.or(defaults.heartbeat),
            prefetch_count: self.prefetch_count.or(defaults.prefetch_count),
            publisher_confirms: self.publisher_confirms.or(defaults.publisher_confirms),
            keepalive: self.keepalive.or(defaults.keepalive),
        }
    }

    pub(crate) fn builtin() -> ConnectionOptions {
        ConnectionOptions {
            host: Some("localhost".to_owned()),
            port: Some(5672),
            login: Some("guest".to_owned()),
            password: Some("guest".to_owned()),
            vhost: Some("/".to_owned()),
            connect_timeout: Some(3.0),
            read_timeout: Some(130.0),
            write_timeout: Some(130.0),
            heartbeat: Some(60),
            prefetch_count: Some(1),
            publisher_confirms: Some(false),
            keepalive: Some(false),
        }
    }
}

/// A `{exchange, routing_key}` pair; `exchange` is a configuration key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingOptions {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: String,
}

/// Raw exchange definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub durable: Option<bool>,
    pub passive: Option<bool>,
    pub arguments: Option<Arguments>,
    pub bindings: Option<Vec<BindingOptions>>,
    pub connection: Option<String>,
}

/// Raw queue definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub name: Option<String>,
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
    pub passive: Option<bool>,
    pub arguments: Option<Arguments>,
    pub bindings: Option<Vec<BindingOptions>>,
    pub connection: Option<String>,
}

/// Options of a single `listen` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerOptions {
    /// The broker considers deliveries acknowledged as soon as they are sent.
    pub auto_ack: Option<bool>,
    /// Accepted deliveries are acknowledged in batches of half the prefetch.
    pub multi_ack: Option<bool>,
    pub consumer_tag: Option<String>,
    pub arguments: Option<Arguments>,
}

impl ListenerOptions {
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = Some(auto_ack);
        self
    }

    pub fn multi_ack(mut self, multi_ack: bool) -> Self {
        self.multi_ack = Some(multi_ack);
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    /// Fills every unset field from `defaults`.
    pub fn merged_over(&self, defaults: &ListenerOptions) -> ListenerOptions {
        ListenerOptions {
            auto_ack: self.auto_ack.or(defaults.auto_ack),
            multi_ack: self.multi_ack.or(defaults.multi_ack),
            consumer_tag: self
                .consumer_tag
                .clone()
                .or_else(|| defaults.consumer_tag.clone()),
            arguments: self.arguments.clone().or_else(|| defaults.arguments.clone()),
        }
    }
}

/// Accepts a number of seconds written as an integer, a float or a numeric string.
fn seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Seconds {
        Number(f64),
        Text(String),
    }

    match Option::<Seconds>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Seconds::Number(value)) => Ok(Some(value)),
        Some(Seconds::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("`{text}` is not a number of seconds"))),
    }
}
