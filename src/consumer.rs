// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Per-delivery settlement. A handler answers every delivery with a
//! `ConsumeResult`; `AckPolicy` turns that answer into broker
//! acknowledgments, either one by one or in batches of half the prefetch
//! window.
//!
//! Batching trades redelivery for fewer round-trips: if the process stops
//! before a batch is full, the accepted but unacknowledged deliveries (at most
//! one batch minus one) are redelivered by the broker.

use crate::{arguments::Arguments, channel::CachedChannel, errors::AmqpError};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// An inbound message and its broker-assigned delivery tag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    /// Message type property.
    pub kind: Option<String>,
    pub message_id: Option<String>,
    pub headers: Arguments,
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Decodes the JSON payload.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConsumeStatus {
    #[default]
    Accept,
    Reject,
}

/// A handler's verdict on one delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeResult {
    pub status: ConsumeStatus,
    /// Only meaningful for rejections.
    pub requeue: bool,
    /// Ends the listen loop once this delivery is settled.
    pub stop: bool,
}

impl ConsumeResult {
    pub fn accept() -> Self {
        ConsumeResult::default()
    }

    pub fn reject(requeue: bool) -> Self {
        ConsumeResult {
            status: ConsumeStatus::Reject,
            requeue,
            stop: false,
        }
    }

    pub fn and_stop(mut self) -> Self {
        self.stop = true;
        self
    }
}

/// Acknowledges or rejects one delivery on the channel it arrived on.
pub struct Acker {
    channel: Arc<CachedChannel>,
    delivery_tag: u64,
}

impl Acker {
    pub(crate) fn new(channel: Arc<CachedChannel>, delivery_tag: u64) -> Self {
        Acker {
            channel,
            delivery_tag,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// With `multiple`, also acknowledges every earlier unacknowledged delivery.
    pub async fn ack(&self, multiple: bool) -> Result<(), AmqpError> {
        let session = self.channel.session().await;
        if let Err(err) = session.channel().basic_ack(self.delivery_tag, multiple).await {
            error!(error = err.to_string(), "error while acking delivery");
            return Err(err);
        }
        Ok(())
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let session = self.channel.session().await;
        if let Err(err) = session
            .channel()
            .basic_nack(self.delivery_tag, false, requeue)
            .await
        {
            error!(error = err.to_string(), "error while nacking delivery");
            return Err(err);
        }
        Ok(())
    }
}

/// Acknowledgment state of one listen call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckPolicy {
    auto_ack: bool,
    /// Batch size; 0 acknowledges every delivery on its own.
    ack_at: u32,
    pending: u32,
}

impl AckPolicy {
    pub fn new(auto_ack: bool, multi_ack: bool, prefetch_count: u16) -> Self {
        // Auto-acknowledged deliveries have nothing left to batch.
        let ack_at = if multi_ack && !auto_ack {
            u32::from(prefetch_count).div_ceil(2)
        } else {
            0
        };

        AckPolicy {
            auto_ack,
            ack_at,
            pending: 0,
        }
    }

    pub fn ack_at(&self) -> u32 {
        self.ack_at
    }

    /// Accepted deliveries not acknowledged yet.
    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Settles one delivery according to the handler's verdict.
    pub async fn settle(&mut self, acker: &Acker, result: &ConsumeResult) -> Result<(), AmqpError> {
        match result.status {
            ConsumeStatus::Accept if self.ack_at > 0 => {
                self.pending += 1;
                if self.pending >= self.ack_at {
                    debug!(
                        delivery_tag = acker.delivery_tag(),
                        count = self.pending,
                        "acknowledging batch"
                    );
                    acker.ack(true).await?;
                    self.pending = 0;
                }
                Ok(())
            }
            ConsumeStatus::Accept if self.auto_ack => Ok(()),
            ConsumeStatus::Accept => acker.ack(false).await,
            ConsumeStatus::Reject if self.auto_ack => {
                warn!(
                    delivery_tag = acker.delivery_tag(),
                    "rejected delivery was already acknowledged by the broker"
                );
                Ok(())
            }
            ConsumeStatus::Reject => acker.nack(result.requeue).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cached_channel, Recorder};
    use serde::Deserialize;

    async fn settle_all(policy: &mut AckPolicy, recorder: &Recorder, results: &[ConsumeResult]) {
        let cached = cached_channel(recorder, recorder.channel(), 10, false);
        for (index, result) in results.iter().enumerate() {
            let acker = Acker::new(cached.clone(), index as u64 + 1);
            policy.settle(&acker, result).await.unwrap();
        }
    }

    #[test]
    fn batch_size_is_half_the_prefetch_rounded_up() {
        assert_eq!(AckPolicy::new(false, true, 10).ack_at(), 5);
        assert_eq!(AckPolicy::new(false, true, 7).ack_at(), 4);
        assert_eq!(AckPolicy::new(false, true, 1).ack_at(), 1);
        assert_eq!(AckPolicy::new(false, false, 10).ack_at(), 0);
        assert_eq!(AckPolicy::new(true, true, 10).ack_at(), 0);
        assert_eq!(AckPolicy::new(false, true, 0).ack_at(), 0);
    }

    #[tokio::test]
    async fn acknowledges_a_full_batch_once() {
        let recorder = Recorder::default();
        let mut policy = AckPolicy::new(false, true, 10);

        settle_all(&mut policy, &recorder, &[ConsumeResult::accept(); 7]).await;

        assert_eq!(recorder.calls(), vec!["ack:5:true"]);
        assert_eq!(policy.pending(), 2);
    }

    #[tokio::test]
    async fn acknowledges_each_delivery_without_batching() {
        let recorder = Recorder::default();
        let mut policy = AckPolicy::new(false, false, 10);

        settle_all(&mut policy, &recorder, &[ConsumeResult::accept(); 3]).await;

        assert_eq!(recorder.calls(), vec!["ack:1:false", "ack:2:false", "ack:3:false"]);
    }

    #[tokio::test]
    async fn auto_ack_issues_no_acknowledgments() {
        let recorder = Recorder::default();
        let mut policy = AckPolicy::new(true, false, 10);

        settle_all(
            &mut policy,
            &recorder,
            &[ConsumeResult::accept(), ConsumeResult::reject(true)],
        )
        .await;

        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn rejects_a_single_delivery() {
        let recorder = Recorder::default();
        let mut policy = AckPolicy::new(false, false, 10);

        settle_all(
            &mut policy,
            &recorder,
            &[ConsumeResult::reject(true), ConsumeResult::reject(false)],
        )
        .await;

        assert_eq!(recorder.calls(), vec!["nack:1:false:true", "nack:2:false:false"]);
    }

    #[tokio::test]
    async fn rejections_do_not_count_towards_a_batch() {
        let recorder = Recorder::default();
        let mut policy = AckPolicy::new(false, true, 4);

        settle_all(
            &mut policy,
            &recorder,
            &[
                ConsumeResult::accept(),
                ConsumeResult::reject(false),
                ConsumeResult::accept(),
            ],
        )
        .await;

        assert_eq!(recorder.calls(), vec!["nack:2:false:false", "ack:3:true"]);
        assert_eq!(policy.pending(), 0);
    }

    #[test]
    fn decodes_json_payloads() {
        #[derive(Deserialize, Debug, PartialEq)]
        struct Job {
            id: u32,
        }

        let delivery = Delivery {
            payload: br#"{"id":7}"#.to_vec(),
            ..Default::default()
        };
        assert_eq!(delivery.json::<Job>(), Ok(Job { id: 7 }));

        let broken = Delivery {
            payload: b"not json".to_vec(),
            ..Default::default()
        };
        assert_eq!(broken.json::<Job>(), Err(AmqpError::ParsePayloadError));
    }
}
