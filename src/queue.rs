// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Normalized queue configuration, including the dead-letter exchange a queue
//! forwards rejected or expired messages to.

use crate::{
    arguments::{self, Arguments, FieldValue},
    config::{QueueOptions, DEFAULT_CONNECTION},
    exchange::Binding,
};

/// Argument naming the exchange that receives dead-lettered messages
pub const AMQP_ARGUMENTS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// Normalized definition of a RabbitMQ queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Broker-visible name; empty lets the broker generate one.
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub arguments: Arguments,
    pub bindings: Vec<Binding>,
    pub connection: String,
}

impl QueueConfig {
    /// Builds the definition of queue `key` from its options merged over `defaults`.
    pub(crate) fn normalize(key: &str, opts: &QueueOptions, defaults: &QueueOptions) -> Self {
        QueueConfig {
            name: opts.name.clone().unwrap_or_else(|| key.to_owned()),
            durable: opts.durable.or(defaults.durable).unwrap_or(false),
            exclusive: opts.exclusive.or(defaults.exclusive).unwrap_or(false),
            auto_delete: opts.auto_delete.or(defaults.auto_delete).unwrap_or(false),
            passive: opts.passive.or(defaults.passive).unwrap_or(false),
            arguments: arguments::merge(
                &defaults.arguments.clone().unwrap_or_default(),
                &opts.arguments.clone().unwrap_or_default(),
            ),
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

    /// Configuration key of the dead-letter exchange, when one is set.
    pub fn dead_letter_exchange(&self) -> Option<&str> {
        self.arguments
            .get(AMQP_ARGUMENTS_DEAD_LETTER_EXCHANGE)
            .and_then(FieldValue::as_str)
    }
}
