// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::aggregator::AggregationStore;
use crate::event::Event;
use crate::filter::{AlertFilter, Rejection};
use crate::queue::QueueReceiver;
use crate::stats::PipelineStats;

/// Moves validated events from the ingestion queue into the aggregation store, dropping the ones
/// the filter rejects.
pub struct IngestWorker {
    store: Arc<AggregationStore>,
    filter: AlertFilter,
    stats: Arc<PipelineStats>,
}

impl IngestWorker {
    pub fn new(store: Arc<AggregationStore>, filter: AlertFilter, stats: Arc<PipelineStats>) -> Self {
        IngestWorker {
            store,
            filter,
            stats,
        }
    }

    pub fn process(&self, event: Event) -> Result<(), Rejection> {
        if let Err(rejection) = self.filter.check(&event) {
            self.stats.record_filtered();
            debug!(
                "Dropping alert sid={} priority={}: {rejection:?}",
                event.rule.sid, event.rule.priority
            );
            return Err(rejection);
        }
        self.store.append(event);
        self.stats.record_buffered();
        Ok(())
    }

    pub async fn run(&self, mut rx: QueueReceiver<Event>, cancel_token: CancellationToken) {
        debug!("Ingest worker started");
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        // rejections are already counted and logged by process
                        if self.process(event).is_err() {
                            continue;
                        }
                    }
                    None => break,
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        debug!("Ingest worker stopped");
    }
}
