// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::AggregationStore;
use crate::digest::{Digest, DigestRenderer};
use crate::queue::QueueSender;
use crate::stats::PipelineStats;

/// When a buffered batch should be flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushPolicy {
    pub max_buckets: usize,
    pub max_window: Duration,
}

/// What a single scheduler tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    NotReady,
    /// Ready, but another caller emptied the store first.
    Empty,
    Queued { events: usize, buckets: usize },
    /// The drained data could not be rendered and was discarded.
    RenderFailed { events: usize, buckets: usize },
    /// The delivery queue is closed; the digest was dropped.
    QueueClosed,
}

pub struct FlushScheduler {
    store: Arc<AggregationStore>,
    renderer: Arc<dyn DigestRenderer>,
    digest_tx: QueueSender<Digest>,
    policy: FlushPolicy,
    check_interval: Duration,
    stats: Arc<PipelineStats>,
}

impl FlushScheduler {
    pub fn new(
        store: Arc<AggregationStore>,
        renderer: Arc<dyn DigestRenderer>,
        digest_tx: QueueSender<Digest>,
        policy: FlushPolicy,
        check_interval: Duration,
        stats: Arc<PipelineStats>,
    ) -> Self {
        FlushScheduler {
            store,
            renderer,
            digest_tx,
            policy,
            check_interval,
            stats,
        }
    }

    /// Polls the store every `check_interval` until `cancel_token` fires.
    pub async fn run(&self, cancel_token: CancellationToken) {
        debug!("Flush scheduler started");
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick();
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        debug!("Flush scheduler stopped");
    }

    /// One scheduler cycle: drain when ready, render, enqueue.
    ///
    /// The drain is committed even when rendering fails, so data that cannot be rendered is not
    /// retried forever.
    pub fn tick(&self) -> FlushOutcome {
        if !self
            .store
            .is_ready(self.policy.max_buckets, self.policy.max_window)
        {
            return FlushOutcome::NotReady;
        }

        let snapshot = self.store.drain();
        if snapshot.is_empty() {
            return FlushOutcome::Empty;
        }
        let events = snapshot.event_count();
        let buckets = snapshot.bucket_count();

        let digest = match self.renderer.render(&snapshot) {
            Ok(digest) => digest,
            Err(e) => {
                self.stats.record_render_failure();
                error!("Failed to render {events} alerts ({buckets} unique), dropping them: {e}");
                return FlushOutcome::RenderFailed { events, buckets };
            }
        };

        if let Err(e) = self.digest_tx.send(digest) {
            error!("Failed to queue digest for delivery: {e}");
            return FlushOutcome::QueueClosed;
        }
        self.stats.record_digest_produced();
        info!("Processed {events} alerts ({buckets} unique) and prepared message for sending");
        FlushOutcome::Queued { events, buckets }
    }
}
