// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Mock broker plumbing shared by the unit tests.

use crate::{
    arguments::Arguments,
    channel::CachedChannel,
    client::{AmqpChannel, MockAmqpChannel, MockAmqpConnection, QueueDeclareOk},
    connection::ConnectionConfig,
    publisher::Message,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Records the broker operations issued on mock channels, in order.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
    arguments: Arc<Mutex<HashMap<String, Arguments>>>,
    published: Arc<Mutex<Vec<Message>>>,
}

impl Recorder {
    pub(crate) fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Arguments of the last declaration of exchange or queue `name`.
    pub(crate) fn arguments(&self, name: &str) -> Arguments {
        self.arguments.lock().unwrap()[name].clone()
    }

    pub(crate) fn published(&self) -> Vec<Message> {
        self.published.lock().unwrap().clone()
    }

    /// A channel accepting every operation except `basic_consume`.
    pub(crate) fn channel(&self) -> MockAmqpChannel {
        self.mock_channel(String::new(), Arc::new(AtomicBool::new(true)))
    }

    /// Like `channel`, with per-delivery operations recorded as
    /// `<label>/<call>`.
    pub(crate) fn labeled_channel(&self, label: &str) -> MockAmqpChannel {
        self.mock_channel(format!("{label}/"), Arc::new(AtomicBool::new(true)))
    }

    /// Like `channel`, reporting itself open while `open` holds.
    pub(crate) fn closable_channel(&self, open: Arc<AtomicBool>) -> MockAmqpChannel {
        self.mock_channel(String::new(), open)
    }

    fn mock_channel(&self, prefix: String, open: Arc<AtomicBool>) -> MockAmqpChannel {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_is_open()
            .returning(move || open.load(Ordering::SeqCst));

        let rec = self.clone();
        channel.expect_basic_qos().returning(move |prefetch, global| {
            rec.push(format!("qos:{prefetch}:{global}"));
            Ok(())
        });

        let rec = self.clone();
        channel.expect_confirm_select().returning(move || {
            rec.push("confirm_select");
            Ok(())
        });

        let rec = self.clone();
        channel
            .expect_exchange_declare()
            .returning(move |name, _, _, arguments| {
                rec.push(format!("exchange:{name}"));
                rec.arguments.lock().unwrap().insert(name.to_owned(), arguments);
                Ok(())
            });

        let rec = self.clone();
        channel
            .expect_queue_declare()
            .returning(move |name, _, arguments| {
                rec.push(format!("queue:{name}"));
                rec.arguments.lock().unwrap().insert(name.to_owned(), arguments);
                let name = if name.is_empty() { "amq.gen-1" } else { name };
                Ok(QueueDeclareOk {
                    name: name.to_owned(),
                    ..Default::default()
                })
            });

        let rec = self.clone();
        channel
            .expect_queue_bind()
            .returning(move |queue, exchange, routing_key| {
                rec.push(format!("bind-queue:{queue}<-{exchange}:{routing_key}"));
                Ok(())
            });

        let rec = self.clone();
        channel
            .expect_exchange_bind()
            .returning(move |destination, source, routing_key| {
                rec.push(format!("bind-exchange:{destination}<-{source}:{routing_key}"));
                Ok(())
            });

        let rec = self.clone();
        channel
            .expect_basic_publish()
            .returning(move |exchange, routing_key, message| {
                rec.push(format!("publish:{exchange}:{routing_key}"));
                rec.published.lock().unwrap().push(message);
                Ok(())
            });

        let rec = self.clone();
        channel.expect_wait_for_confirms().returning(move || {
            rec.push("wait_for_confirms");
            Ok(())
        });

        let rec = self.clone();
        let label = prefix.clone();
        channel.expect_basic_ack().returning(move |tag, multiple| {
            rec.push(format!("{label}ack:{tag}:{multiple}"));
            Ok(())
        });

        let rec = self.clone();
        let label = prefix.clone();
        channel
            .expect_basic_nack()
            .returning(move |tag, multiple, requeue| {
                rec.push(format!("{label}nack:{tag}:{multiple}:{requeue}"));
                Ok(())
            });

        let rec = self.clone();
        channel.expect_close().returning(move || {
            rec.push(format!("{prefix}close-channel"));
            Ok(())
        });

        channel
    }
}

pub(crate) fn connection_config(prefetch_count: u16, publisher_confirms: bool) -> ConnectionConfig {
    ConnectionConfig {
        name: "default".to_owned(),
        host: "localhost".to_owned(),
        port: 5672,
        login: "guest".to_owned(),
        password: "guest".to_owned(),
        vhost: "/".to_owned(),
        connect_timeout: Duration::from_secs(3),
        read_timeout: Duration::from_secs(130),
        write_timeout: Duration::from_secs(130),
        read_write_timeout: Duration::from_secs(130),
        heartbeat: 60,
        prefetch_count,
        publisher_confirms,
        keepalive: false,
    }
}

/// Wraps `channel` into a cache entry living on an always-connected connection.
pub(crate) fn cached_channel(
    recorder: &Recorder,
    channel: MockAmqpChannel,
    prefetch_count: u16,
    publisher_confirms: bool,
) -> Arc<CachedChannel> {
    let mut connection = MockAmqpConnection::new();
    connection.expect_is_connected().return_const(true);
    let rec = recorder.clone();
    connection.expect_close().returning(move || {
        rec.push("close-connection");
        Ok(())
    });

    Arc::new(CachedChannel::new(
        Arc::new(connection_config(prefetch_count, publisher_confirms)),
        Arc::new(connection),
        Arc::new(channel) as Arc<dyn AmqpChannel>,
    ))
}
