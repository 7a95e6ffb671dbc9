// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module maps a logical connection name to one transport connection and
//! the channels opened on it:
//! - a cached channel used for declarations and publishing, reused while it is
//!   open and replaced once it is not
//! - one dedicated channel per consumer, since delivery tags and acknowledgments
//!   are scoped to a channel
//!
//! A connection is reused while it reports itself connected. Every channel is
//! configured with the connection's prefetch; the cached channel also enters
//! confirm mode when publisher confirms are enabled.
//!
//! Each channel owns the declaration state of the exchanges and queues declared
//! through it, so replacing a channel starts from a clean slate.

use crate::{
    client::{AmqpChannel, AmqpConnection, AmqpConnector},
    connection::{ConnectionConfig, ConnectionRegistry},
    errors::AmqpError,
    topology::DeclarationState,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error};

/// A channel together with the connection it lives on.
pub struct CachedChannel {
    config: Arc<ConnectionConfig>,
    connection: Arc<dyn AmqpConnection>,
    channel: Arc<dyn AmqpChannel>,
    state: Mutex<DeclarationState>,
}

impl CachedChannel {
    pub(crate) fn new(
        config: Arc<ConnectionConfig>,
        connection: Arc<dyn AmqpConnection>,
        channel: Arc<dyn AmqpChannel>,
    ) -> Self {
        CachedChannel {
            config,
            connection,
            channel,
            state: Mutex::new(DeclarationState::default()),
        }
    }

    /// Settings of the connection this channel was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_alive(&self) -> bool {
        self.connection.is_connected() && self.channel.is_open()
    }

    /// Waits for exclusive use of the channel.
    ///
    /// Every protocol operation goes through a session, so at most one
    /// operation is in flight on the channel at a time.
    pub async fn session(&self) -> ChannelSession<'_> {
        ChannelSession {
            channel: self.channel.as_ref(),
            config: &self.config,
            state: self.state.lock().await,
        }
    }
}

/// Exclusive access to a cached channel and its declaration state.
pub struct ChannelSession<'a> {
    channel: &'a dyn AmqpChannel,
    config: &'a ConnectionConfig,
    state: MutexGuard<'a, DeclarationState>,
}

impl<'a> ChannelSession<'a> {
    pub fn channel(&self) -> &'a dyn AmqpChannel {
        self.channel
    }

    pub fn config(&self) -> &'a ConnectionConfig {
        self.config
    }

    pub fn state(&self) -> &DeclarationState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut DeclarationState {
        &mut self.state
    }
}


#[derive(Default)]
struct Entries {
    connections: HashMap<String, Arc<dyn AmqpConnection>>,
    channels: HashMap<String, Arc<CachedChannel>>,
    consumers: Vec<Arc<CachedChannel>>,
}

/// Connections and channels per logical connection name.
pub struct ChannelCache {
    registry: Arc<ConnectionRegistry>,
    connector: Arc<dyn AmqpConnector>,
    entries: Mutex<Entries>,
}

impl ChannelCache {
    pub fn new(registry: Arc<ConnectionRegistry>, connector: Arc<dyn AmqpConnector>) -> Self {
        ChannelCache {
            registry,
            connector,
            entries: Mutex::default(),
        }
    }

    /// Returns the cached channel of connection `name`, opening a new one when
    /// none is cached or the cached one is no longer open.
    pub async fn channel(&self, name: &str) -> Result<Arc<CachedChannel>, AmqpError> {
        let mut entries = self.entries.lock().await;

        if let Some(cached) = entries.channels.get(name) {
            if cached.is_alive() {
                return Ok(cached.clone());
            }
            debug!(connection = name, "cached channel is no longer open, reopening");
        }

        let config = self.registry.resolve(name)?;
        let cached = Arc::new(self.open(&mut entries, config, true).await?);
        entries.channels.insert(name.to_owned(), cached.clone());

        Ok(cached)
    }

    /// Opens a channel on connection `name` for the exclusive use of one
    /// consumer. It stays open until `close_all`.
    pub async fn consumer_channel(&self, name: &str) -> Result<Arc<CachedChannel>, AmqpError> {
        let mut entries = self.entries.lock().await;
        entries.consumers.retain(|consumer| consumer.is_alive());

        let config = self.registry.resolve(name)?;
        let cached = Arc::new(self.open(&mut entries, config, false).await?);
        entries.consumers.push(cached.clone());

        Ok(cached)
    }

    async fn open(
        &self,
        entries: &mut Entries,
        config: Arc<ConnectionConfig>,
        confirms: bool,
    ) -> Result<CachedChannel, AmqpError> {
        let live = entries
            .connections
            .get(&config.name)
            .filter(|connection| connection.is_connected())
            .cloned();

        let (connection, fresh) = match live {
            Some(connection) => (connection, false),
            None => (self.connector.connect(&config).await?, true),
        };

        match Self::open_channel(&config, connection.as_ref(), confirms).await {
            Ok(channel) => {
                if fresh {
                    entries
                        .connections
                        .insert(config.name.clone(), connection.clone());
                }
                Ok(CachedChannel::new(config, connection, channel))
            }
            Err(err) => {
                if fresh {
                    if let Err(close_err) = connection.close().await {
                        error!(error = close_err.to_string(), "failure to close connection");
                    }
                }
                Err(err)
            }
        }
    }

    async fn open_channel(
        config: &ConnectionConfig,
        connection: &dyn AmqpConnection,
        confirms: bool,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!(connection = config.name, "creating amqp channel...");
        let channel = connection.create_channel().await?;

        if let Err(err) = Self::configure(config, channel.as_ref(), confirms).await {
            if channel.is_open() {
                if let Err(close_err) = channel.close().await {
                    error!(error = close_err.to_string(), "failure to close channel");
                }
            }
            return Err(err);
        }

        Ok(channel)
    }

    async fn configure(
        config: &ConnectionConfig,
        channel: &dyn AmqpChannel,
        confirms: bool,
    ) -> Result<(), AmqpError> {
        if let Err(err) = channel.basic_qos(config.prefetch_count, false).await {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(err);
        }

        if confirms && config.publisher_confirms {
            if let Err(err) = channel.confirm_select().await {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                return Err(err);
            }
            debug!(connection = config.name, "publisher confirms enabled");
        }

        Ok(())
    }

    /// Closes every channel, cached or consuming, then every distinct
    /// connection once.
    ///
    /// Closing continues past failures; the first failure is returned.
    pub async fn close_all(&self) -> Result<(), AmqpError> {
        let (channels, mut connections) = {
            let mut entries = self.entries.lock().await;
            let mut channels: Vec<Arc<CachedChannel>> =
                entries.channels.drain().map(|(_, c)| c).collect();
            channels.append(&mut entries.consumers);
            let connections: Vec<Arc<dyn AmqpConnection>> =
                entries.connections.drain().map(|(_, c)| c).collect();
            (channels, connections)
        };

        let mut first_err = None;

        for cached in &channels {
            if cached.channel.is_open() {
                if let Err(err) = cached.channel.close().await {
                    error!(error = err.to_string(), "failure to close channel");
                    first_err.get_or_insert(err);
                }
            }

            if !connections
                .iter()
                .any(|known| Arc::ptr_eq(known, &cached.connection))
            {
                connections.push(cached.connection.clone());
            }
        }

        for connection in connections {
            if !connection.is_connected() {
                continue;
            }
            if let Err(err) = connection.close().await {
                error!(error = err.to_string(), "failure to close connection");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
