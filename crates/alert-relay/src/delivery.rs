// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single consumer of the delivery queue.
//!
//! Digests leave in the order they were produced. Two consecutive transmissions are always at
//! least [`DeliveryPolicy::min_interval`] apart, measured from the completion of the last
//! successful send. A digest that still fails after `max_retries` attempts is dropped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::digest::Digest;
use crate::errors::{DeliveryError, TransportError};
use crate::queue::QueueReceiver;
use crate::stats::PipelineStats;

/// One outbound notification call. Any error is treated as retryable.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub min_interval: Duration,
    pub max_retries: u32,
    /// Delay before retry `n` (zero based) is `backoff_base * 2^n`.
    pub backoff_base: Duration,
}

impl DeliveryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2_u32.saturating_pow(attempt))
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy {
            min_interval: Duration::from_secs(5),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

pub struct DeliveryWorker {
    transport: Arc<dyn Transport>,
    policy: DeliveryPolicy,
    last_sent: Option<Instant>,
    stats: Arc<PipelineStats>,
}

impl DeliveryWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: DeliveryPolicy,
        stats: Arc<PipelineStats>,
    ) -> Self {
        DeliveryWorker {
            transport,
            policy,
            last_sent: None,
            stats,
        }
    }

    /// Drains `rx` until it closes or `cancel_token` fires. Failed digests are logged and dropped.
    pub async fn run(&mut self, mut rx: QueueReceiver<Digest>, cancel_token: CancellationToken) {
        debug!("Delivery worker started");
        loop {
            let digest = tokio::select! {
                digest = rx.recv() => match digest {
                    Some(digest) => digest,
                    None => break,
                },
                _ = cancel_token.cancelled() => break,
            };

            match self.deliver(&digest, &cancel_token).await {
                Ok(attempts) => {
                    self.stats.record_sent();
                    info!("Message sent after {attempts} attempt(s)");
                }
                Err(DeliveryError::Cancelled { attempts }) => {
                    warn!("Shutdown while sending, message dropped after {attempts} attempt(s)");
                    break;
                }
                Err(e) => {
                    self.stats.record_delivery_failure();
                    error!("Failed to send message, dropping it: {e}");
                }
            }
        }
        debug!("Delivery worker stopped");
    }

    /// Sends one digest, honoring the spacing and retry policy. Returns the number of attempts it
    /// took.
    pub async fn deliver(
        &mut self,
        digest: &Digest,
        cancel_token: &CancellationToken,
    ) -> Result<u32, DeliveryError> {
        if let Some(wait) = self.spacing_remaining() {
            debug!("Waiting {:.2}s before next send", wait.as_secs_f64());
            if !pause(wait, cancel_token).await {
                return Err(DeliveryError::Cancelled { attempts: 0 });
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let start = Instant::now();
            match self.transport.send(digest.as_str()).await {
                Ok(()) => {
                    self.last_sent = Some(Instant::now());
                    debug!(
                        "Sent message in {} ms (attempt {attempt})",
                        start.elapsed().as_millis()
                    );
                    return Ok(attempt);
                }
                Err(e) if attempt >= self.policy.max_retries => {
                    return Err(DeliveryError::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let backoff = self.policy.backoff(attempt - 1);
                    warn!(
                        "Send attempt {attempt}/{} failed: {e}. Retrying in {}s",
                        self.policy.max_retries,
                        backoff.as_secs_f64()
                    );
                    if !pause(backoff, cancel_token).await {
                        return Err(DeliveryError::Cancelled { attempts: attempt });
                    }
                }
            }
        }
    }

    fn spacing_remaining(&self) -> Option<Duration> {
        let since = self.last_sent?.elapsed();
        self.policy
            .min_interval
            .checked_sub(since)
            .filter(|wait| !wait.is_zero())
    }
}

/// Sleeps for `duration`. False when cancelled first.
async fn pause(duration: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = sleep(duration) => true,
        _ = cancel_token.cancelled() => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue;
    use std::sync::Mutex;

    /// Fails the first `failures` calls, then succeeds. Records when each call happened.
    struct FakeTransport {
        failures: u32,
        calls: Mutex<Vec<(Instant, String)>>,
    }

    impl FakeTransport {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(FakeTransport {
                failures,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(Instant, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&self, text: &str) -> Result<(), TransportError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((Instant::now(), text.to_string()));
            if calls.len() as u32 <= self.failures {
                Err(TransportError::Other("connection reset".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn worker(transport: Arc<FakeTransport>) -> DeliveryWorker {
        DeliveryWorker::new(
            transport,
            DeliveryPolicy::default(),
            Arc::new(PipelineStats::default()),
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = DeliveryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_two_failures() {
        let transport = FakeTransport::new(2);
        let mut worker = worker(Arc::clone(&transport));
        let cancel_token = CancellationToken::new();

        let start = Instant::now();
        let attempts = worker
            .deliver(&Digest::new("hello"), &cancel_token)
            .await
            .unwrap();
        assert_eq!(attempts, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[1].0 - calls[0].0, Duration::from_secs(1));
        assert_eq!(calls[2].0 - calls[1].0, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_transport_stops_at_max_retries() {
        let transport = FakeTransport::new(u32::MAX);
        let mut worker = worker(Arc::clone(&transport));

        let err = worker
            .deliver(&Digest::new("hello"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(transport.calls().len(), 3);
        // failures do not count as a transmission for spacing
        assert!(worker.last_sent.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_sends_are_spaced() {
        let transport = FakeTransport::new(0);
        let mut worker = worker(Arc::clone(&transport));
        let cancel_token = CancellationToken::new();

        for text in ["one", "two", "three"] {
            worker
                .deliver(&Digest::new(text), &cancel_token)
                .await
                .unwrap();
        }

        let calls = transport.calls();
        for pair in calls.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= Duration::from_secs(5));
        }

        // no wait once the interval has already passed
        tokio::time::advance(Duration::from_secs(6)).await;
        let before = Instant::now();
        worker
            .deliver(&Digest::new("four"), &cancel_token)
            .await
            .unwrap();
        assert_eq!(transport.calls()[3].0, before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_preserves_order_and_survives_failures() {
        let transport = FakeTransport::new(3);
        let stats = Arc::new(PipelineStats::default());
        let mut worker = DeliveryWorker::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            DeliveryPolicy::default(),
            Arc::clone(&stats),
        );
        let (tx, rx) = queue::unbounded();
        for text in ["first", "second", "third"] {
            tx.send(Digest::new(text)).unwrap();
        }
        drop(tx);

        worker.run(rx, CancellationToken::new()).await;

        let texts: Vec<String> = transport.calls().into_iter().map(|(_, t)| t).collect();
        assert_eq!(
            texts,
            vec!["first", "first", "first", "second", "third"]
        );
        let counters = stats.snapshot();
        assert_eq!(counters.digests_failed, 1);
        assert_eq!(counters.digests_sent, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let transport = FakeTransport::new(u32::MAX);
        let mut worker = worker(Arc::clone(&transport));
        let cancel_token = CancellationToken::new();

        let canceller = {
            let cancel_token = cancel_token.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(500)).await;
                cancel_token.cancel();
            })
        };

        let err = worker
            .deliver(&Digest::new("hello"), &cancel_token)
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Cancelled { attempts: 1 }));
        canceller.await.unwrap();
    }
}
