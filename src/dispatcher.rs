// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Consumes a configured queue and hands every delivery to a
//! `DeliveryHandler`. The queue and its dependencies are declared before the
//! consumer is registered. Deliveries are processed one at a time: the handler
//! runs, its verdict is settled through the `AckPolicy`, and only then is the
//! next delivery awaited.
//!
//! A handler error ends the loop and leaves the failing delivery
//! unacknowledged, for the broker to redeliver.

use crate::{
    channel::ChannelCache,
    client::ConsumeOptions,
    config::ListenerOptions,
    consumer::{AckPolicy, Acker, ConsumeResult, Delivery},
    errors::AmqpError,
    otel,
    resolver::TopologyResolver,
    topology::TopologyDeclarer,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, future::Future, sync::Arc};
use tracing::{debug, error};

/// Error type handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes deliveries of a listen call.
#[async_trait]
pub trait DeliveryHandler: Send {
    /// Decides the fate of `delivery`. `ctx` carries the trace context
    /// propagated by the publisher.
    async fn handle(&mut self, ctx: &Context, delivery: &Delivery) -> Result<ConsumeResult, HandlerError>;
}

/// Drives listen loops over configured queues.
pub struct AmqpDispatcher {
    resolver: Arc<TopologyResolver>,
    channels: Arc<ChannelCache>,
    declarer: Arc<TopologyDeclarer>,
    defaults: ListenerOptions,
}

impl AmqpDispatcher {
    pub fn new(
        resolver: Arc<TopologyResolver>,
        channels: Arc<ChannelCache>,
        declarer: Arc<TopologyDeclarer>,
        defaults: ListenerOptions,
    ) -> Self {
        AmqpDispatcher {
            resolver,
            channels,
            declarer,
            defaults,
        }
    }

    /// Consumes `queue` until the handler asks to stop.
    ///
    /// A queue without traffic keeps this call waiting indefinitely.
    pub async fn listen<H>(&self, queue: &str, handler: &mut H, options: &ListenerOptions) -> Result<(), AmqpError>
    where
        H: DeliveryHandler + ?Sized,
    {
        self.listen_until(queue, handler, options, std::future::pending())
            .await
    }

    /// Like `listen`, but also returns once `shutdown` completes.
    ///
    /// `shutdown` is only observed while waiting for the next delivery, so a
    /// delivery being handled is always settled first.
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
        let options = options.merged_over(&self.defaults);
        let auto_ack = options.auto_ack.unwrap_or(false);

        let config = self.resolver.queue_config(queue)?;
        // Delivery tags are channel scoped, so every consumer gets its own channel.
        let cached = self.channels.consumer_channel(&config.connection).await?;
        let mut policy = AckPolicy::new(
            auto_ack,
            options.multi_ack.unwrap_or(false),
            cached.config().prefetch_count,
        );

        let (queue_name, stream) = {
            let mut session = cached.session().await;
            let declared = self.declarer.declare_queue(&mut session, queue).await?;

            let stream = match session
                .channel()
                .basic_consume(
                    &declared.name,
                    options.consumer_tag.as_deref().unwrap_or_default(),
                    ConsumeOptions {
                        no_local: false,
                        no_ack: auto_ack,
                        exclusive: false,
                        no_wait: false,
                    },
                    options.arguments.clone().unwrap_or_default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to create the consumer");
                    return Err(err);
                }
                Ok(stream) => stream,
            };

            (declared.name, stream)
        };

        debug!(queue = queue_name, ack_at = policy.ack_at(), "consuming");

        let mut deliveries = stream.map(|next| {
            next.map(|delivery| {
                let acker = Acker::new(cached.clone(), delivery.delivery_tag);
                (delivery, acker)
            })
        });
        let tracer = global::tracer("amqp consumer");
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!(queue = queue_name, "listener shut down");
                    return Ok(());
                }
                next = deliveries.next() => next,
            };

            let Some(next) = next else {
                error!(queue = queue_name, "consumer stream closed");
                return Err(AmqpError::ChannelError(format!(
                    "consumer of `{queue_name}` was closed by the broker"
                )));
            };
            let (delivery, acker) = next?;

            let (ctx, mut span) = otel::new_span(&delivery.headers, &tracer, &queue_name);

            let result = match handler.handle(&ctx, &delivery).await {
                Ok(result) => result,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        delivery_tag = delivery.delivery_tag,
                        "delivery handler failed"
                    );
                    span.set_status(Status::Error {
                        description: Cow::from(err.to_string()),
                    });
                    return Err(AmqpError::HandlerError(err.to_string()));
                }
            };

            if let Err(err) = policy.settle(&acker, &result).await {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to settle delivery"),
                });
                return Err(err);
            }
            span.set_status(Status::Ok);

            if result.stop {
                debug!(queue = queue_name, "listener stopped by handler");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{AmqpChannel, AmqpConnection, MockAmqpConnection, MockAmqpConnector},
        config::{ConnectionOptions, ExchangeOptions, QueueOptions},
        connection::ConnectionRegistry,
        testing::Recorder,
    };
    use futures_util::stream;
    use std::{
        collections::{HashMap, VecDeque},
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Answers deliveries with scripted results, in order.
    struct Scripted {
        results: VecDeque<Result<ConsumeResult, String>>,
        seen: Vec<u64>,
    }

    impl Scripted {
        fn new(results: Vec<Result<ConsumeResult, String>>) -> Self {
            Scripted {
                results: results.into(),
                seen: vec![],
            }
        }
    }

    #[async_trait]
    impl DeliveryHandler for Scripted {
        async fn handle(&mut self, _: &Context, delivery: &Delivery) -> Result<ConsumeResult, HandlerError> {
            self.seen.push(delivery.delivery_tag);
            match self.results.pop_front() {
                Some(Ok(result)) => Ok(result),
                Some(Err(reason)) => Err(reason.into()),
                None => Ok(ConsumeResult::accept()),
            }
        }
    }

    fn deliveries(count: u64) -> Vec<Delivery> {
        (1..=count)
            .map(|tag| Delivery {
                delivery_tag: tag,
                payload: format!("message {tag}").into_bytes(),
                ..Default::default()
            })
            .collect()
    }

    /// A dispatcher over queue `jobs`, whose consumer yields `pending` and then
    /// either ends or stays open forever.
    fn dispatcher(
        recorder: &Recorder,
        prefetch: u16,
        pending: Vec<Delivery>,
        stay_open: bool,
    ) -> AmqpDispatcher {
        let registry = Arc::new(ConnectionRegistry::new(
            HashMap::from([(
                "default".to_owned(),
                ConnectionOptions {
                    prefetch_count: Some(prefetch),
                    ..Default::default()
                },
            )]),
            &ConnectionOptions::default(),
        ));

        let rec = recorder.clone();
        let mut connector = MockAmqpConnector::new();
        connector.expect_connect().returning(move |_| {
            let rec = rec.clone();
            let pending = pending.clone();
            let mut connection = MockAmqpConnection::new();
            connection.expect_is_connected().return_const(true);
            connection.expect_create_channel().returning(move || {
                let mut channel = rec.channel();
                let rec = rec.clone();
                let pending = pending.clone();
                channel
                    .expect_basic_consume()
                    .returning(move |queue, _, options, _| {
                        rec.push(format!("consume:{queue}:no_ack={}", options.no_ack));
                        let items = stream::iter(pending.clone().into_iter().map(Ok));
                        Ok(if stay_open {
                            items.chain(stream::pending()).boxed()
                        } else {
                            items.boxed()
                        })
                    });
                Ok(Arc::new(channel) as Arc<dyn AmqpChannel>)
            });
            Ok(Arc::new(connection) as Arc<dyn AmqpConnection>)
        });

        let resolver = Arc::new(TopologyResolver::new(
            HashMap::from([("dlx".to_owned(), ExchangeOptions::default())]),
            HashMap::from([(
                "jobs".to_owned(),
                QueueOptions {
                    arguments: Some(
                        [(
                            "x-dead-letter-exchange".to_owned(),
                            crate::arguments::FieldValue::from("dlx"),
                        )]
                        .into(),
                    ),
                    ..Default::default()
                },
            )]),
            ExchangeOptions::default(),
            QueueOptions::default(),
        ));

        AmqpDispatcher::new(
            resolver.clone(),
            Arc::new(ChannelCache::new(registry, Arc::new(connector))),
            Arc::new(TopologyDeclarer::new(resolver)),
            ListenerOptions::default(),
        )
    }

    fn settlements(recorder: &Recorder) -> Vec<String> {
        recorder
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("ack") || call.starts_with("nack"))
            .collect()
    }

    #[tokio::test]
    async fn declares_then_consumes() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder, 1, deliveries(1), true);
        let mut handler = Scripted::new(vec![Ok(ConsumeResult::accept().and_stop())]);

        dispatcher
            .listen("jobs", &mut handler, &ListenerOptions::default())
            .await
            .unwrap();

        assert_eq!(
            recorder.calls(),
            vec![
                "qos:1:false",
                "exchange:dlx",
                "queue:jobs",
                "consume:jobs:no_ack=false",
                "ack:1:false",
            ]
        );
    }

    #[tokio::test]
    async fn batches_acknowledgments_by_half_the_prefetch() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder, 10, deliveries(6), true);
        let mut script = vec![Ok(ConsumeResult::accept()); 5];
        script.push(Ok(ConsumeResult::accept().and_stop()));
        let mut handler = Scripted::new(script);

        dispatcher
            .listen(
                "jobs",
                &mut handler,
                &ListenerOptions::default().multi_ack(true),
            )
            .await
            .unwrap();

        assert_eq!(settlements(&recorder), vec!["ack:5:true"]);
    }

    #[tokio::test]
    async fn stop_takes_effect_after_settling_the_current_delivery() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder, 10, deliveries(5), true);
        let mut handler = Scripted::new(vec![
            Ok(ConsumeResult::accept()),
            Ok(ConsumeResult::reject(true)),
            Ok(ConsumeResult::accept().and_stop()),
        ]);

        dispatcher
            .listen("jobs", &mut handler, &ListenerOptions::default())
            .await
            .unwrap();

        assert_eq!(handler.seen, vec![1, 2, 3]);
        assert_eq!(
            settlements(&recorder),
            vec!["ack:1:false", "nack:2:false:true", "ack:3:false"]
        );
    }

    #[tokio::test]
    async fn auto_ack_consumers_send_no_acknowledgments() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder, 10, deliveries(2), true);
        let mut handler = Scripted::new(vec![
            Ok(ConsumeResult::accept()),
            Ok(ConsumeResult::accept().and_stop()),
        ]);

        dispatcher
            .listen("jobs", &mut handler, &ListenerOptions::default().auto_ack(true))
            .await
            .unwrap();

        assert!(recorder.calls().contains(&"consume:jobs:no_ack=true".to_owned()));
        assert!(settlements(&recorder).is_empty());
    }

    #[tokio::test]
    async fn handler_errors_end_the_loop_without_settling() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder, 10, deliveries(3), true);
        let mut handler = Scripted::new(vec![
            Ok(ConsumeResult::accept()),
            Err("database unavailable".to_owned()),
        ]);

        let result = dispatcher
            .listen("jobs", &mut handler, &ListenerOptions::default())
            .await;

        assert_eq!(
            result,
            Err(AmqpError::HandlerError("database unavailable".to_owned()))
        );
        assert_eq!(handler.seen, vec![1, 2]);
        assert_eq!(settlements(&recorder), vec!["ack:1:false"]);
    }

    #[tokio::test]
    async fn closed_consumer_is_a_channel_error() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder, 10, deliveries(1), false);
        let mut handler = Scripted::new(vec![]);

        let result = dispatcher
            .listen("jobs", &mut handler, &ListenerOptions::default())
            .await;

        assert!(matches!(result, Err(AmqpError::ChannelError(_))));
        assert_eq!(settlements(&recorder), vec!["ack:1:false"]);
    }

    #[tokio::test]
    async fn shutdown_ends_an_idle_listener() {
        let recorder = Recorder::default();
        let dispatcher = dispatcher(&recorder, 10, deliveries(2), true);
        let mut handler = Scripted::new(vec![]);
        let options = ListenerOptions::default();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let listening = dispatcher.listen_until(
            "jobs",
            &mut handler,
            &options,
            async move {
                let _ = rx.await;
            },
        );
        let trigger = async move {
            tokio::task::yield_now().await;
            let _ = tx.send(());
        };
        let (result, _) = tokio::join!(listening, trigger);

        assert_eq!(result, Ok(()));
        assert_eq!(settlements(&recorder), vec!["ack:1:false", "ack:2:false"]);
    }

    #[tokio::test]
    async fn concurrent_listeners_settle_on_their_own_channels() {
        let recorder = Recorder::default();
        let opened = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(ConnectionRegistry::new(
            HashMap::from([(
                "default".to_owned(),
                ConnectionOptions {
                    prefetch_count: Some(4),
                    ..Default::default()
                },
            )]),
            &ConnectionOptions::default(),
        ));

        let rec = recorder.clone();
        let counter = opened.clone();
        let mut connector = MockAmqpConnector::new();
        connector.expect_connect().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            let rec = rec.clone();
            let created = Arc::new(AtomicUsize::new(0));
            let mut connection = MockAmqpConnection::new();
            connection.expect_is_connected().return_const(true);
            connection.expect_create_channel().returning(move || {
                let label = format!("ch{}", created.fetch_add(1, Ordering::SeqCst) + 1);
                let mut channel = rec.labeled_channel(&label);
                let rec = rec.clone();
                channel
                    .expect_basic_consume()
                    .returning(move |queue, _, _, _| {
                        rec.push(format!("{label}/consume:{queue}"));
                        // Delivery tags start over on every channel.
                        let count = if queue == "a" { 2 } else { 1 };
                        Ok(stream::iter(deliveries(count).into_iter().map(Ok))
                            .chain(stream::pending())
                            .boxed())
                    });
                Ok(Arc::new(channel) as Arc<dyn AmqpChannel>)
            });
            Ok(Arc::new(connection) as Arc<dyn AmqpConnection>)
        });

        let resolver = Arc::new(TopologyResolver::new(
            HashMap::new(),
            HashMap::from([
                ("a".to_owned(), QueueOptions::default()),
                ("b".to_owned(), QueueOptions::default()),
            ]),
            ExchangeOptions::default(),
            QueueOptions::default(),
        ));
        let dispatcher = AmqpDispatcher::new(
            resolver.clone(),
            Arc::new(ChannelCache::new(registry, Arc::new(connector))),
            Arc::new(TopologyDeclarer::new(resolver)),
            ListenerOptions::default(),
        );

        let options = ListenerOptions::default().multi_ack(true);
        let mut first = Scripted::new(vec![
            Ok(ConsumeResult::accept()),
            Ok(ConsumeResult::accept().and_stop()),
        ]);
        let mut second = Scripted::new(vec![Ok(ConsumeResult::reject(true).and_stop())]);

        let (a, b) = tokio::join!(
            dispatcher.listen("a", &mut first, &options),
            dispatcher.listen("b", &mut second, &options),
        );
        a.unwrap();
        b.unwrap();

        let calls = recorder.calls();
        let channel_of = |consume: &str| {
            calls
                .iter()
                .find(|call| call.ends_with(consume))
                .and_then(|call| call.split('/').next())
                .map(str::to_owned)
                .unwrap()
        };
        let a_channel = channel_of("/consume:a");
        let b_channel = channel_of("/consume:b");

        assert_ne!(a_channel, b_channel);
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert!(calls.contains(&format!("{a_channel}/ack:2:true")));
        assert!(calls.contains(&format!("{b_channel}/nack:1:false:true")));
        assert_eq!(
            calls
                .iter()
                .filter(|call| call.contains("/ack:") || call.contains("/nack:"))
                .count(),
            2
        );
    }
}
