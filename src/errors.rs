// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Topology Adapter
//!
//! Every operation of this crate (declare, publish, listen) reports failures
//! through `AmqpError`. Errors raised by the protocol client are classified at
//! the transport boundary into connection-level and channel-level failures,
//! keeping the original cause as text.

use std::fmt;
use thiserror::Error;

/// The kind of configuration entry a lookup was made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Connection,
    Exchange,
    Queue,
}

impl fmt::Display for ConfigKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigKind::Connection => f.write_str("connection"),
            ConfigKind::Exchange => f.write_str("exchange"),
            ConfigKind::Queue => f.write_str("queue"),
        }
    }
}

/// The kind of broker entity taking part in a declaration chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Exchange,
    Queue,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Exchange => f.write_str("exchange"),
            EntityKind::Queue => f.write_str("queue"),
        }
    }
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// `ConfigNotFound` and `CircularDependency` are configuration defects and are
/// never retried. `ConnectionError` and `ChannelError` wrap failures of the
/// underlying protocol client, with the client's message as cause.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// A referenced connection, exchange or queue is absent from configuration
    #[error("{0} `{1}` not found in configuration")]
    ConfigNotFound(ConfigKind, String),

    /// The configuration maps were present but could not be normalized
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A declaration chain revisited an entity that is still being declared
    #[error("circular dependency while declaring {0} `{1}`")]
    CircularDependency(EntityKind, String),

    /// Transport-level failure opening or using a connection
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Protocol-level failure on an otherwise live connection
    #[error("channel failure: {0}")]
    ChannelError(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// A delivery handler failed; the delivery is left unacknowledged
    #[error("delivery handler failed: {0}")]
    HandlerError(String),
}
