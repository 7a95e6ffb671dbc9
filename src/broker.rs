// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker Facade
//!
//! Wires the connection registry, the channel cache, the topology resolver and
//! declarer, the publisher and the dispatcher out of one `AmqpConfig`.
//!
//! Connections are opened lazily and stay open until `shutdown`. Use `scoped`
//! to have them closed on every exit path of a unit of work.
//!
//! ## Examples
//!
//! ```ignore
//! let config = AmqpConfig::from_json(&text)?;
//! let broker = AmqpBroker::lapin(config, "billing");
//!
//! broker
//!     .scoped(|broker| async move {
//!         broker
//!             .publish(&Context::current(), "invoices", &Message::new("hi"), None)
//!             .await
//!     })
//!     .await?;
//! ```

use crate::{
    channel::{CachedChannel, ChannelCache},
    client::{AmqpConnector, QueueDeclareOk},
    config::{AmqpConfig, ListenerOptions},
    connection::{ConnectionConfig, ConnectionRegistry},
    dispatcher::{AmqpDispatcher, DeliveryHandler},
    errors::AmqpError,
    publisher::{AmqpPublisher, Message, Publisher},
    resolver::TopologyResolver,
    topology::TopologyDeclarer,
    transport::LapinConnector,
};
use opentelemetry::Context;
use std::{future::Future, sync::Arc};
use tracing::{debug, error};

pub struct AmqpBroker {
    registry: Arc<ConnectionRegistry>,
    resolver: Arc<TopologyResolver>,
    channels: Arc<ChannelCache>,
    declarer: Arc<TopologyDeclarer>,
    publisher: AmqpPublisher,
    dispatcher: AmqpDispatcher,
}

impl AmqpBroker {
    pub fn new(config: AmqpConfig, connector: Arc<dyn AmqpConnector>) -> Self {
        let AmqpConfig {
            connections,
            exchanges,
            queues,
            defaults,
        } = config;

        let registry = Arc::new(ConnectionRegistry::new(connections, &defaults.connection));
        let resolver = Arc::new(TopologyResolver::new(
            exchanges,
            queues,
            defaults.exchange,
            defaults.queue,
        ));
        let channels = Arc::new(ChannelCache::new(registry.clone(), connector));
        let declarer = Arc::new(TopologyDeclarer::new(resolver.clone()));

        let publisher = AmqpPublisher::new(resolver.clone(), channels.clone(), declarer.clone());
        let dispatcher = AmqpDispatcher::new(
            resolver.clone(),
            channels.clone(),
            declarer.clone(),
            defaults.listener,
        );

        AmqpBroker {
            registry,
            resolver,
            channels,
            declarer,
            publisher,
            dispatcher,
        }
    }

    /// A broker talking to RabbitMQ through lapin. `app_name` names the
    /// connections in the management UI.
    pub fn lapin(config: AmqpConfig, app_name: &str) -> Self {
        AmqpBroker::new(config, Arc::new(LapinConnector::new(app_name)))
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn publisher(&self) -> &AmqpPublisher {
        &self.publisher
    }

    pub fn dispatcher(&self) -> &AmqpDispatcher {
        &self.dispatcher
    }

    /// Normalized settings of the connection configured under `name`.
    pub fn connection(&self, name: &str) -> Result<Arc<ConnectionConfig>, AmqpError> {
        self.registry.resolve(name)
    }

    pub async fn publish(
        &self,
        ctx: &Context,
        exchange: &str,
        message: &Message,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError> {
        self.publisher
            .publish(ctx, exchange, message, routing_key)
            .await
    }

    pub async fn listen<H>(&self, queue: &str, handler: &mut H, options: &ListenerOptions) -> Result<(), AmqpError>
    where
        H: DeliveryHandler + ?Sized,
    {
        self.dispatcher.listen(queue, handler, options).await
    }

    pub async fn listen_until<H, F>(
        &self,
        queue: &str,
        handler: &mut H,
        options: &ListenerOptions,
        shutdown: F,
    ) -> Result<(), AmqpError>
    where
        H: DeliveryHandler + ?Sized,
        F: Future<Output = ()> + Send,
    {
        self.dispatcher
            .listen_until(queue, handler, options, shutdown)
            .await
    }

    /// Declares the exchange configured under `name` and its dependencies on
    /// the exchange's connection. `Ok(false)` means it was already declared.
    pub async fn declare_exchange(&self, name: &str) -> Result<bool, AmqpError> {
        let config = self.resolver.exchange_config(name)?;
        let cached = self.channels.channel(&config.connection).await?;
        let mut session = cached.session().await;

        self.declarer.declare_exchange(&mut session, name).await
    }

    /// Declares the queue configured under `name`, its dependencies and its
    /// bindings on the queue's connection.
    pub async fn declare_queue(&self, name: &str) -> Result<QueueDeclareOk, AmqpError> {
        let config = self.resolver.queue_config(name)?;
        let cached = self.channels.channel(&config.connection).await?;
        let mut session = cached.session().await;

        self.declarer.declare_queue(&mut session, name).await
    }

    /// The live channel of connection `name`, opened on demand.
    pub async fn channel(&self, name: &str) -> Result<Arc<CachedChannel>, AmqpError> {
        self.channels.channel(name).await
    }

    /// Closes every cached channel, then every connection once.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        debug!("closing amqp connections");

        if let Err(err) = self.channels.close_all().await {
            error!(error = err.to_string(), "failure to close amqp connections");
            return Err(err);
        }
        Ok(())
    }

    /// Runs `work` and shuts the broker down afterwards, whether `work`
    /// succeeded or not. An error of `work` wins over a shutdown error.
    pub async fn scoped<F, Fut, T>(self, work: F) -> Result<T, AmqpError>
    where
        F: FnOnce(Arc<AmqpBroker>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let broker = Arc::new(self);
        let result = work(broker.clone()).await;
        let closed = broker.shutdown().await;

        match (result, closed) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}
