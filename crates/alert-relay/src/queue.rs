// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Unbounded FIFO channels that keep track of their own depth.
//!
//! Used for both the ingestion queue (events) and the delivery queue (digests). Producers never
//! wait; the single consumer suspends in [`QueueReceiver::recv`] until an item is available.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

pub fn unbounded<T>() -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            depth: Arc::clone(&depth),
        },
        QueueReceiver { rx, depth },
    )
}

#[derive(Debug)]
pub struct QueueSender<T> {
    tx: mpsc::UnboundedSender<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            depth: Arc::clone(&self.depth),
        }
    }
}

impl<T> QueueSender<T> {
    /// Fails only when the consumer is gone; the item is handed back inside the error.
    pub fn send(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        // counted before the send so the consumer can never observe a negative depth
        self.depth.fetch_add(1, Ordering::AcqRel);
        self.tx.send(item).inspect_err(|_| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        })
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn depth_gauge(&self) -> QueueDepth {
        QueueDepth(Arc::clone(&self.depth))
    }
}

#[derive(Debug)]
pub struct QueueReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
    depth: Arc<AtomicUsize>,
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item. `None` once every sender is dropped and the queue is empty.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    pub fn try_recv(&mut self) -> Option<T> {
        let item = self.rx.try_recv().ok();
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Read-only view of a queue's depth for the stats reporter.
#[derive(Debug, Clone)]
pub struct QueueDepth(Arc<AtomicUsize>);

impl QueueDepth {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_and_depth() {
        let (tx, mut rx) = unbounded();
        let gauge = tx.depth_gauge();
        for i in 0..5 {
            tx.send(i).unwrap();
        }
        assert_eq!(gauge.get(), 5);
        assert_eq!(rx.depth(), 5);

        for i in 0..5 {
            assert_eq!(rx.recv().await, Some(i));
        }
        assert_eq!(gauge.get(), 0);
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_recv_none_after_senders_dropped() {
        let (tx, mut rx) = unbounded();
        tx.send("last").unwrap();
        drop(tx);
        assert_eq!(rx.recv().await, Some("last"));
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_send_to_closed_queue_keeps_depth() {
        let (tx, rx) = unbounded();
        drop(rx);
        let err = tx.send(42).unwrap_err();
        assert_eq!(err.0, 42);
        assert_eq!(tx.depth(), 0);
    }
}
