// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Declaration
//!
//! Declares an exchange or a queue together with everything it depends on:
//! the exchanges it is bound to, its alternate exchange and its dead-letter
//! exchange. Dependencies are always declared before the entity that needs
//! them, and bindings are issued once the entity itself exists.
//!
//! Declaration progress is tracked per channel in a `DeclarationState`:
//! - an entity marked in progress that is entered again closes a cycle
//! - an exchange marked done is never declared again on that channel
//! - queues are re-declared on every call, so updated bindings get applied

use crate::{
    arguments::FieldValue,
    channel::ChannelSession,
    client::{ExchangeDeclareOptions, QueueDeclareOk, QueueDeclareOptions},
    errors::{AmqpError, EntityKind},
    exchange::{ExchangeConfig, AMQP_ARGUMENTS_ALTERNATE_EXCHANGE},
    queue::AMQP_ARGUMENTS_DEAD_LETTER_EXCHANGE,
    resolver::TopologyResolver,
};
use futures_util::future::BoxFuture;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Declaration progress of the entities declared through one channel.
#[derive(Debug, Default)]
pub struct DeclarationState {
    marks: HashMap<(EntityKind, String), Mark>,
}

impl DeclarationState {
    pub fn is_declared(&self, kind: EntityKind, name: &str) -> bool {
        self.mark(kind, name) == Some(Mark::Done)
    }

    /// Number of entities currently being declared.
    pub fn in_progress(&self) -> usize {
        self.marks
            .values()
            .filter(|mark| **mark == Mark::InProgress)
            .count()
    }

    fn mark(&self, kind: EntityKind, name: &str) -> Option<Mark> {
        self.marks.get(&(kind, name.to_owned())).copied()
    }

    /// Marks `name` in progress; fails when it already is.
    pub(crate) fn enter(&mut self, kind: EntityKind, name: &str) -> Result<(), AmqpError> {
        if self.mark(kind, name) == Some(Mark::InProgress) {
            error!(kind = kind.to_string(), name, "circular dependency");
            return Err(AmqpError::CircularDependency(kind, name.to_owned()));
        }

        self.marks.insert((kind, name.to_owned()), Mark::InProgress);
        Ok(())
    }

    /// Exchanges stay declared for the lifetime of the channel; queues do not.
    pub(crate) fn complete(&mut self, kind: EntityKind, name: &str) {
        match kind {
            EntityKind::Exchange => {
                self.marks.insert((kind, name.to_owned()), Mark::Done);
            }
            EntityKind::Queue => {
                self.marks.remove(&(kind, name.to_owned()));
            }
        }
    }

    pub(crate) fn abort(&mut self, kind: EntityKind, name: &str) {
        self.marks.remove(&(kind, name.to_owned()));
    }
}

/// Declares exchanges and queues, dependencies first.
pub struct TopologyDeclarer {
    resolver: Arc<TopologyResolver>,
}

impl TopologyDeclarer {
    pub fn new(resolver: Arc<TopologyResolver>) -> Self {
        TopologyDeclarer { resolver }
    }

    /// Declares the exchange configured under `name` and, before it, every
    /// exchange it depends on.
    ///
    /// Returns `Ok(false)` without talking to the broker when the exchange was
    /// already declared on this channel.
    pub fn declare_exchange<'a>(
        &'a self,
        session: &'a mut ChannelSession<'_>,
        name: &'a str,
    ) -> BoxFuture<'a, Result<bool, AmqpError>> {
        Box::pin(async move {
            if session.state().is_declared(EntityKind::Exchange, name) {
                return Ok(false);
            }

            let config = self.resolver.exchange_config(name)?;
            session.state_mut().enter(EntityKind::Exchange, name)?;

            match self.install_exchange(session, &config).await {
                Ok(()) => {
                    session.state_mut().complete(EntityKind::Exchange, name);
                    Ok(true)
                }
                Err(err) => {
                    session.state_mut().abort(EntityKind::Exchange, name);
                    Err(err)
                }
            }
        })
    }

    async fn install_exchange(
        &self,
        session: &mut ChannelSession<'_>,
        config: &ExchangeConfig,
    ) -> Result<(), AmqpError> {
        let mut sources = Vec::with_capacity(config.bindings.len());
        for binding in &config.bindings {
            self.declare_exchange(session, &binding.exchange).await?;
            let source = self.resolver.exchange_config(&binding.exchange)?;
            sources.push((source, binding.routing_key.as_str()));
        }

        let mut arguments = config.arguments.clone();
        if let Some(alternate) = config.alternate_exchange() {
            self.declare_exchange(session, alternate).await?;
            let alternate = self.resolver.exchange_config(alternate)?;
            arguments.insert(
                AMQP_ARGUMENTS_ALTERNATE_EXCHANGE.to_owned(),
                FieldValue::from(alternate.name.as_str()),
            );
        }

        debug!("creating exchange: {}", config.name);

        if let Err(err) = session
            .channel()
            .exchange_declare(
                &config.name,
                config.kind.clone(),
                ExchangeDeclareOptions {
                    passive: config.passive,
                    durable: config.durable,
                    auto_delete: false,
                    internal: false,
                    no_wait: false,
                },
                arguments,
            )
            .await
        {
            error!(
                error = err.to_string(),
                name = config.name,
                "error to declare the exchange"
            );
            return Err(err);
        }

        for (source, routing_key) in sources {
            debug!(
                "binding exchange: {} to the exchange: {} with the key: {}",
                config.name, source.name, routing_key
            );

            if let Err(err) = session
                .channel()
                .exchange_bind(&config.name, &source.name, routing_key)
                .await
            {
                error!(error = err.to_string(), "error to bind exchange to exchange");
                return Err(err);
            }
        }

        debug!("exchange: {} was created", config.name);
        Ok(())
    }

    /// Declares the queue configured under `name`, its dead-letter exchange
    /// and the exchanges it is bound to, then binds it.
    ///
    /// Returns the broker's answer, carrying the broker-visible queue name.
    pub async fn declare_queue(
        &self,
        session: &mut ChannelSession<'_>,
        name: &str,
    ) -> Result<QueueDeclareOk, AmqpError> {
        session.state_mut().enter(EntityKind::Queue, name)?;

        match self.install_queue(session, name).await {
            Ok(declared) => {
                session.state_mut().complete(EntityKind::Queue, name);
                Ok(declared)
            }
            Err(err) => {
                session.state_mut().abort(EntityKind::Queue, name);
                Err(err)
            }
        }
    }

    async fn install_queue(
        &self,
        session: &mut ChannelSession<'_>,
        name: &str,
    ) -> Result<QueueDeclareOk, AmqpError> {
        let config = self.resolver.queue_config(name)?;

        let mut arguments = config.arguments.clone();
        if let Some(dlx) = config.dead_letter_exchange() {
            self.declare_exchange(session, dlx).await?;
            let dlx = self.resolver.exchange_config(dlx)?;
            arguments.insert(
                AMQP_ARGUMENTS_DEAD_LETTER_EXCHANGE.to_owned(),
                FieldValue::from(dlx.name.as_str()),
            );
        }

        debug!("creating queue: {}", config.name);

        let declared = match session
            .channel()
            .queue_declare(
                &config.name,
                QueueDeclareOptions {
                    passive: config.passive,
                    durable: config.durable,
                    exclusive: config.exclusive,
                    auto_delete: config.auto_delete,
                    no_wait: false,
                },
                arguments,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = config.name, "error to declare the queue");
                return Err(err);
            }
            Ok(declared) => declared,
        };

        for binding in &config.bindings {
            self.declare_exchange(session, &binding.exchange).await?;
            let exchange = self.resolver.exchange_config(&binding.exchange)?;

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                declared.name, exchange.name, binding.routing_key
            );

            if let Err(err) = session
                .channel()
                .queue_bind(&declared.name, &exchange.name, &binding.routing_key)
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }
        }

        debug!("queue: {} was created", declared.name);
        Ok(declared)
    }
}
