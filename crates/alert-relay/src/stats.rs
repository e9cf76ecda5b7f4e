// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters sampled by the periodic reporter and the `/stats` endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregator::AggregationStore;
use crate::queue::QueueDepth;

#[derive(Debug, Default)]
pub struct PipelineStats {
    requests_received: AtomicU64,
    events_rejected: AtomicU64,
    events_filtered: AtomicU64,
    events_buffered: AtomicU64,
    digests_produced: AtomicU64,
    render_failures: AtomicU64,
    digests_sent: AtomicU64,
    digests_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub requests_received: u64,
    pub events_rejected: u64,
    pub events_filtered: u64,
    pub events_buffered: u64,
    pub digests_produced: u64,
    pub render_failures: u64,
    pub digests_sent: u64,
    pub digests_failed: u64,
}

impl PipelineStats {
    pub fn record_request(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.events_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.events_filtered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_buffered(&self) {
        self.events_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_digest_produced(&self) {
        self.digests_produced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_render_failure(&self) {
        self.render_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.digests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery_failure(&self) {
        self.digests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            events_rejected: self.events_rejected.load(Ordering::Relaxed),
            events_filtered: self.events_filtered.load(Ordering::Relaxed),
            events_buffered: self.events_buffered.load(Ordering::Relaxed),
            digests_produced: self.digests_produced.load(Ordering::Relaxed),
            render_failures: self.render_failures.load(Ordering::Relaxed),
            digests_sent: self.digests_sent.load(Ordering::Relaxed),
            digests_failed: self.digests_failed.load(Ordering::Relaxed),
        }
    }
}

/// Everything the observability side can read, in one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub ingest_queue_depth: usize,
    pub delivery_queue_depth: usize,
    pub buffered_events: usize,
    pub buffered_buckets: usize,
}

/// Request rate since the previous report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RequestRate {
    pub total: u64,
    pub recent: u64,
    pub elapsed: Duration,
    pub per_second: f64,
}

/// Read-only access to all pipeline gauges and counters.
#[derive(Clone)]
pub struct StatsSource {
    stats: Arc<PipelineStats>,
    store: Arc<AggregationStore>,
    ingest_depth: QueueDepth,
    delivery_depth: QueueDepth,
}

impl StatsSource {
    pub fn new(
        stats: Arc<PipelineStats>,
        store: Arc<AggregationStore>,
        ingest_depth: QueueDepth,
        delivery_depth: QueueDepth,
    ) -> Self {
        StatsSource {
            stats,
            store,
            ingest_depth,
            delivery_depth,
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let buffered = self.store.depth();
        StatsSnapshot {
            counters: self.stats.snapshot(),
            ingest_queue_depth: self.ingest_depth.get(),
            delivery_queue_depth: self.delivery_depth.get(),
            buffered_events: buffered.events,
            buffered_buckets: buffered.buckets,
        }
    }
}

pub struct StatsReporter {
    source: StatsSource,
    interval: Duration,
    last_report: Mutex<(Instant, u64)>,
}

impl StatsReporter {
    pub fn new(source: StatsSource, interval: Duration) -> Self {
        StatsReporter {
            source,
            interval,
            last_report: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Returns the request rate since the previous call and starts a new measurement period.
    pub fn take_rate(&self, total: u64) -> RequestRate {
        #[allow(clippy::expect_used)]
        let mut last = self.last_report.lock().expect("lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(last.0);
        let recent = total.saturating_sub(last.1);
        let secs = elapsed.as_secs_f64();
        *last = (now, total);
        RequestRate {
            total,
            recent,
            elapsed,
            per_second: if secs > 0.0 { recent as f64 / secs } else { 0.0 },
        }
    }

    pub fn report(&self) -> StatsSnapshot {
        let snapshot = self.source.snapshot();
        let rate = self.take_rate(snapshot.counters.requests_received);
        info!(
            "Handler: Received requests: {} ({} in last {:.2} seconds: {:.2}/s) | Queue sizes: in={}, out={}, buf={} ({} unique) | Sent: {}, failed: {}",
            rate.total,
            rate.recent,
            rate.elapsed.as_secs_f64(),
            rate.per_second,
            snapshot.ingest_queue_depth,
            snapshot.delivery_queue_depth,
            snapshot.buffered_events,
            snapshot.buffered_buckets,
            snapshot.counters.digests_sent,
            snapshot.counters.digests_failed,
        );
        snapshot
    }

    pub async fn run(&self, cancel_token: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.report();
                }
                _ = cancel_token.cancelled() => {
                    break;
                }
            }
        }
        debug!("Stats reporter stopped");
    }
}
