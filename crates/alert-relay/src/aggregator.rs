// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory store grouping buffered events by [`GroupingKey`].
//!
//! Every operation takes the same lock for one short critical section. `drain` swaps the whole
//! state out, so a flush always sees a consistent set of buckets and producers keep appending to
//! the fresh, empty state. The lock is a blocking one and is never held across an `.await`:
//! rendering and sending work on the owned [`Snapshot`].

use std::mem;
use std::sync::Mutex;
use std::time::Duration;

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::event::{Event, GroupingKey};

/// Events sharing one grouping key, in arrival order. Never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub key: GroupingKey,
    pub events: Vec<Event>,
}

impl Bucket {
    pub fn first(&self) -> &Event {
        // buckets are created with their first event and only ever grow
        &self.events[0]
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Owned result of a [`AggregationStore::drain`]; buckets keep their creation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub buckets: Vec<Bucket>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn event_count(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }
}

#[derive(Debug, Default)]
struct State {
    buckets: Vec<Bucket>,
    index: HashMap<GroupingKey, usize>,
    event_count: usize,
    /// Set when the store goes from empty to non-empty.
    window_start: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct AggregationStore {
    state: Mutex<State>,
}

/// Point-in-time size of the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreDepth {
    pub events: usize,
    pub buckets: usize,
}

impl AggregationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        #[allow(clippy::expect_used)]
        self.state.lock().expect("lock poisoned")
    }

    /// Adds `event` to the bucket for its key, creating the bucket if needed. Opens a new
    /// buffering window when the store was empty.
    pub fn append(&self, event: Event) {
        let key = event.grouping_key();
        let mut state = self.lock();

        if state.buckets.is_empty() {
            state.window_start = Some(Instant::now());
        }

        match state.index.get(&key).copied() {
            Some(position) => state.buckets[position].events.push(event),
            None => {
                let position = state.buckets.len();
                state.index.insert(key.clone(), position);
                state.buckets.push(Bucket {
                    key,
                    events: vec![event],
                });
            }
        }
        state.event_count += 1;
    }

    /// True when the store holds something and either the bucket limit is reached or the current
    /// window has been open for at least `max_window`.
    pub fn is_ready(&self, max_buckets: usize, max_window: Duration) -> bool {
        let state = self.lock();
        if state.buckets.is_empty() {
            return false;
        }
        if state.buckets.len() >= max_buckets {
            return true;
        }
        state
            .window_start
            .is_some_and(|start| start.elapsed() >= max_window)
    }

    /// Takes every bucket out of the store and closes the window. Empty when nothing was
    /// buffered.
    pub fn drain(&self) -> Snapshot {
        let taken = mem::take(&mut *self.lock());
        Snapshot {
            buckets: taken.buckets,
        }
    }

    pub fn depth(&self) -> StoreDepth {
        let state = self.lock();
        StoreDepth {
            events: state.event_count,
            buckets: state.buckets.len(),
        }
    }

    /// How long the current window has been open, if one is.
    #[cfg(test)]
    pub(crate) fn window_age(&self) -> Option<Duration> {
        self.lock().window_start.map(|start| start.elapsed())
    }
}
