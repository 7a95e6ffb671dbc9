// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Normalized exchange configuration. Exchanges are the routing mechanism in
//! RabbitMQ that determine how messages are distributed to queues and to other
//! exchanges bound to them.

use crate::{
    arguments::{self, Arguments, FieldValue},
    config::{BindingOptions, ExchangeOptions, DEFAULT_CONNECTION},
};

/// Argument naming the exchange that receives messages this exchange cannot route
pub const AMQP_ARGUMENTS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";
/// Argument carrying the routing type of a delayed-message exchange
pub const AMQP_ARGUMENTS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
/// - Custom: Any other type provided by a broker plugin
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
    Custom(String),
}

impl From<&str> for ExchangeKind {
    fn from(value: &str) -> Self {
        match value {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            "x-delayed-message" => ExchangeKind::XMessageDelayed,
            other => ExchangeKind::Custom(other.to_owned()),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
            ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind),
        }
    }
}

/// Routes messages of the exchange named by `exchange` (a configuration key)
/// carrying `routing_key` into the bound entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub routing_key: String,
}

impl From<&BindingOptions> for Binding {
    fn from(opts: &BindingOptions) -> Self {
        Binding {
            exchange: opts.exchange.clone(),
            routing_key: opts.routing_key.clone(),
        }
    }
}

/// Normalized definition of a RabbitMQ exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Broker-visible name.
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub passive: bool,
    pub arguments: Arguments,
    /// Exchanges this one receives from, in declaration order.
    pub bindings: Vec<Binding>,
    pub connection: String,
}

impl ExchangeConfig {
    /// Builds the definition of exchange `key` from its options merged over `defaults`.
    pub(crate) fn normalize(key: &str, opts: &ExchangeOptions, defaults: &ExchangeOptions) -> Self {
        let kind = opts
            .kind
            .as_deref()
            .or(defaults.kind.as_deref())
            .map(ExchangeKind::from)
            .unwrap_or_default();

        let mut arguments = arguments::merge(
            &defaults.arguments.clone().unwrap_or_default(),
            &opts.arguments.clone().unwrap_or_default(),
        );
        if kind == ExchangeKind::XMessageDelayed {
            arguments
                .entry(AMQP_ARGUMENTS_DELAYED_EXCHANGE_TYPE.to_owned())
                .or_insert_with(|| FieldValue::from("direct"));
        }

        ExchangeConfig {
            name: opts.name.clone().unwrap_or_else(|| key.to_owned()),
            kind,
            durable: opts.durable.or(defaults.durable).unwrap_or(false),
            passive: opts.passive.or(defaults.passive).unwrap_or(false),
            arguments,
            bindings: opts
                .bindings
                .as_ref()
                .or(defaults.bindings.as_ref())
                .map(|bindings| bindings.iter().map(Binding::from).collect())
                .unwrap_or_default(),
            connection: opts
                .connection
                .clone()
                .or_else(|| defaults.connection.clone())
                .unwrap_or_else(|| DEFAULT_CONNECTION.to_owned()),
        }
    }

    /// Configuration key of the alternate exchange, when one is set.
    pub fn alternate_exchange(&self) -> Option<&str> {
        self.arguments
            .get(AMQP_ARGUMENTS_ALTERNATE_EXCHANGE)
            .and_then(FieldValue::as_str)
    }
}
