// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Configuration Resolver
//!
//! Turns raw exchange and queue options into normalized definitions. A name is
//! resolved once; later lookups return the memoized definition.

use crate::{
    config::{ExchangeOptions, QueueOptions},
    errors::{AmqpError, ConfigKind},
    exchange::ExchangeConfig,
    queue::QueueConfig,
};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

pub struct TopologyResolver {
    exchanges: HashMap<String, ExchangeOptions>,
    queues: HashMap<String, QueueOptions>,
    exchange_defaults: ExchangeOptions,
    queue_defaults: QueueOptions,
    resolved_exchanges: RwLock<HashMap<String, Arc<ExchangeConfig>>>,
    resolved_queues: RwLock<HashMap<String, Arc<QueueConfig>>>,
}

impl TopologyResolver {
    pub fn new(
        exchanges: HashMap<String, ExchangeOptions>,
        queues: HashMap<String, QueueOptions>,
        exchange_defaults: ExchangeOptions,
        queue_defaults: QueueOptions,
    ) -> Self {
        TopologyResolver {
            exchanges,
            queues,
            exchange_defaults,
            queue_defaults,
            resolved_exchanges: RwLock::default(),
            resolved_queues: RwLock::default(),
        }
    }

    /// Normalized definition of the exchange configured under `name`.
    pub fn exchange_config(&self, name: &str) -> Result<Arc<ExchangeConfig>, AmqpError> {
        memoized(&self.resolved_exchanges, name, || {
            let raw = self
                .exchanges
                .get(name)
                .ok_or_else(|| AmqpError::ConfigNotFound(ConfigKind::Exchange, name.to_owned()))?;
            Ok(ExchangeConfig::normalize(name, raw, &self.exchange_defaults))
        })
    }

    /// Normalized definition of the queue configured under `name`.
    pub fn queue_config(&self, name: &str) -> Result<Arc<QueueConfig>, AmqpError> {
        memoized(&self.resolved_queues, name, || {
            let raw = self
                .queues
                .get(name)
                .ok_or_else(|| AmqpError::ConfigNotFound(ConfigKind::Queue, name.to_owned()))?;
            Ok(QueueConfig::normalize(name, raw, &self.queue_defaults))
        })
    }
}

fn memoized<T, F>(
    memo: &RwLock<HashMap<String, Arc<T>>>,
    name: &str,
    resolve: F,
) -> Result<Arc<T>, AmqpError>
where
    F: FnOnce() -> Result<T, AmqpError>,
{
    if let Some(found) = memo.read().map_err(|_| AmqpError::InternalError)?.get(name) {
        return Ok(found.clone());
    }

    let resolved = Arc::new(resolve()?);
    let mut memo = memo.write().map_err(|_| AmqpError::InternalError)?;
    Ok(memo.entry(name.to_owned()).or_insert(resolved).clone())
}
