// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Registry
//!
//! Owns the named logical connections and normalizes their settings. A
//! connection's configuration is resolved on first reference and memoized for
//! the lifetime of the registry.

use crate::{
    config::ConnectionOptions,
    errors::{AmqpError, ConfigKind},
};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::debug;

/// Normalized settings of one logical broker connection.
#[derive(Clone, PartialEq)]
pub struct ConnectionConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    pub vhost: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Never lower than twice the heartbeat interval.
    pub read_write_timeout: Duration,
    /// Heartbeat interval in seconds, 0 disables heartbeats.
    pub heartbeat: u16,
    pub prefetch_count: u16,
    pub publisher_confirms: bool,
    pub keepalive: bool,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("login", &self.login)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_write_timeout", &self.read_write_timeout)
            .field("heartbeat", &self.heartbeat)
            .field("prefetch_count", &self.prefetch_count)
            .field("publisher_confirms", &self.publisher_confirms)
            .field("keepalive", &self.keepalive)
            .finish()
    }
}

impl ConnectionConfig {
    /// Normalizes merged options; every field is expected to be set.
    pub(crate) fn normalize(name: &str, opts: &ConnectionOptions) -> Result<ConnectionConfig, AmqpError> {
        let read_timeout = duration("read_timeout", opts.read_timeout)?;
        let write_timeout = duration("write_timeout", opts.write_timeout)?;
        let heartbeat = opts.heartbeat.unwrap_or_default();

        // Sockets timing out before two missed heartbeats drop healthy connections.
        let floor = Duration::from_secs(u64::from(heartbeat) * 2);
        let read_write_timeout = read_timeout.min(write_timeout).max(floor);

        Ok(ConnectionConfig {
            name: name.to_owned(),
            host: opts.host.clone().unwrap_or_default(),
            port: opts.port.unwrap_or_default(),
            login: opts.login.clone().unwrap_or_default(),
            password: opts.password.clone().unwrap_or_default(),
            vhost: opts.vhost.clone().unwrap_or_default(),
            connect_timeout: duration("connect_timeout", opts.connect_timeout)?,
            read_timeout,
            write_timeout,
            read_write_timeout,
            heartbeat,
            prefetch_count: opts.prefetch_count.unwrap_or_default(),
            publisher_confirms: opts.publisher_confirms.unwrap_or_default(),
            keepalive: opts.keepalive.unwrap_or_default(),
        })
    }
}

fn duration(field: &str, seconds: Option<f64>) -> Result<Duration, AmqpError> {
    Duration::try_from_secs_f64(seconds.unwrap_or_default())
        .map_err(|err| AmqpError::InvalidConfig(format!("{field}: {err}")))
}

/// Registry of named logical connections.
pub struct ConnectionRegistry {
    raw: HashMap<String, ConnectionOptions>,
    defaults: ConnectionOptions,
    resolved: RwLock<HashMap<String, Arc<ConnectionConfig>>>,
}

impl ConnectionRegistry {
    /// Creates a registry; `defaults` is merged over the built-in defaults.
    pub fn new(raw: HashMap<String, ConnectionOptions>, defaults: &ConnectionOptions) -> Self {
        ConnectionRegistry {
            raw,
            defaults: defaults.merged_over(&ConnectionOptions::builtin()),
            resolved: RwLock::default(),
        }
    }

    /// Returns the normalized settings of connection `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<ConnectionConfig>, AmqpError> {
        if let Some(config) = self
            .resolved
            .read()
            .map_err(|_| AmqpError::InternalError)?
            .get(name)
        {
            return Ok(config.clone());
        }

        let Some(raw) = self.raw.get(name) else {
            return Err(AmqpError::ConfigNotFound(ConfigKind::Connection, name.to_owned()));
        };

        let config = Arc::new(ConnectionConfig::normalize(
            name,
            &raw.merged_over(&self.defaults),
        )?);
        debug!(
            name,
            host = config.host,
            port = config.port,
            "connection config resolved"
        );

        let mut resolved = self.resolved.write().map_err(|_| AmqpError::InternalError)?;
        Ok(resolved.entry(name.to_owned()).or_insert(config).clone())
    }
}
