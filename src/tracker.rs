//! High-water mark tracking for index progress.
//!
//! This module provides the `HighWaterMarkTracker`, which holds the highest ledger height known to
//! be materialized into the index. The mark is advanced only by notifications coming from the
//! index, never decreases, and fans every advance out to registered listeners.
//!
//! A single tracker is shared (through an `Arc`) by the notification channel client, which feeds
//! it, and by every watcher waiting for the index to catch up.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

use crate::height::Height;

/// Callback invoked with the new high-water mark every time it advances.
///
/// Listeners run while the tracker is locked and must not call back into the tracker.
pub type HeightListener = Arc<dyn Fn(Height) + Send + Sync>;

/// Handle returned by [`HighWaterMarkTracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Subscription(u64);

struct TrackerState {
    high_water: Height,
    next_id: u64,
    listeners: BTreeMap<u64, HeightListener>,
}

/// Tracks the highest height materialized into the index.
///
/// Mutation and listener dispatch happen under one lock, so listeners observe advances in the
/// order they were applied.
pub struct HighWaterMarkTracker {
    state: Mutex<TrackerState>,
}

impl HighWaterMarkTracker {
    /// Create a tracker starting at height 0.
    pub fn new() -> Self {
        Self::with_initial(0)
    }

    /// Create a tracker starting at a known height.
    pub fn with_initial(initial: Height) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                high_water: initial,
                next_id: 0,
                listeners: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // A panicking listener must not wedge every future waiter.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that the index has materialized `height`.
    ///
    /// Stale or duplicate heights are ignored. Returns `true` when the mark advanced.
    pub fn observe(&self, height: Height) -> bool {
        let mut state = self.lock();
        if height <= state.high_water {
            trace!(
                "Ignoring height {} at or below high-water mark {}",
                height, state.high_water
            );
            return false;
        }

        let previous = state.high_water;
        state.high_water = height;
        debug!(
            "High-water mark advanced from {} to {} ({} listeners)",
            previous,
            height,
            state.listeners.len()
        );
        for listener in state.listeners.values() {
            listener(height);
        }
        true
    }

    /// Current high-water mark.
    pub fn current_high_water(&self) -> Height {
        self.lock().high_water
    }

    /// Register a listener called with the new mark on every advance.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Height) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, Arc::new(listener));
        Subscription(id)
    }

    /// Remove a listener. Removing an unknown or already removed subscription is a no-op.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.lock().listeners.remove(&subscription.0).is_some()
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }
}

impl Default for HighWaterMarkTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HighWaterMarkTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("HighWaterMarkTracker")
            .field("high_water", &state.high_water)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}
