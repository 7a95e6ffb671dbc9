// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes messages to configured exchanges. The exchange, and everything it
//! depends on, is declared on the channel before the first publish. When the
//! owning connection has publisher confirms enabled, `publish` returns only
//! after the broker confirmed the message.

use crate::{
    arguments::{Arguments, FieldValue},
    channel::ChannelCache,
    errors::AmqpError,
    otel::HeaderInjector,
    resolver::TopologyResolver,
    topology::TopologyDeclarer,
};
use async_trait::async_trait;
use opentelemetry::{global, Context};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// An outbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    /// Message type property.
    pub kind: Option<String>,
    /// Generated when unset.
    pub message_id: Option<String>,
    pub headers: Arguments,
    pub persistent: bool,
}

impl Message {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Serializes `value` as a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, AmqpError> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        Ok(Message {
            payload,
            content_type: Some(JSON_CONTENT_TYPE.to_owned()),
            ..Default::default()
        })
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<FieldValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `message` to the exchange configured under `exchange`.
    async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        message: &Message,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
pub struct AmqpPublisher {
    resolver: Arc<TopologyResolver>,
    channels: Arc<ChannelCache>,
    declarer: Arc<TopologyDeclarer>,
}

impl AmqpPublisher {
    pub fn new(
        resolver: Arc<TopologyResolver>,
        channels: Arc<ChannelCache>,
        declarer: Arc<TopologyDeclarer>,
    ) -> Self {
        AmqpPublisher {
            resolver,
            channels,
            declarer,
        }
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    /// Publishes a message, propagating the OpenTelemetry context of `ctx` in
    /// the message headers.
    async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        message: &Message,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError> {
        let config = self.resolver.exchange_config(exchange)?;
        let cached = self.channels.channel(&config.connection).await?;
        let mut session = cached.session().await;

        self.declarer.declare_exchange(&mut session, exchange).await?;

        let mut outbound = message.clone();
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut HeaderInjector::new(&mut outbound.headers))
        });

        let routing_key = routing_key.unwrap_or_default();
        if let Err(err) = session
            .channel()
            .basic_publish(&config.name, routing_key, outbound)
            .await
        {
            error!(error = err.to_string(), "error publishing message");
            return Err(err);
        }

        if session.config().publisher_confirms {
            if let Err(err) = session.channel().wait_for_confirms().await {
                error!(error = err.to_string(), "publish was not confirmed");
                return Err(err);
            }
        }

        debug!(exchange = config.name, routing_key, "message published");
        Ok(())
    }
}
