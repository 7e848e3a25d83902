// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Read-only snapshot of externally pinned timestamps.
//!
//! A pinned timestamp marks a point in time whose generations must survive
//! retention (point-in-time restore). The registry itself is external; this
//! engine only consumes snapshots of it and treats an old snapshot as stale,
//! refusing to delete anything until it is refreshed.

use std::collections::BTreeSet;
use std::time::Duration;

/// Snapshot of the pinned-timestamp registry.
#[derive(Debug, Clone, Default)]
pub struct PinnedTimestamps {
    /// Wall-clock time (epoch millis) the registry was last refreshed.
    pub refreshed_at_millis: u64,
    /// The pinned timestamps, in epoch millis.
    pub timestamps: BTreeSet<u64>,
}

impl PinnedTimestamps {
    /// Creates a snapshot from a refresh time and a set of timestamps.
    pub fn new(refreshed_at_millis: u64, timestamps: impl IntoIterator<Item = u64>) -> Self {
        Self { refreshed_at_millis, timestamps: timestamps.into_iter().collect() }
    }

    /// True if the snapshot is older than `bound` as of `now_millis`.
    #[must_use]
    pub fn is_stale(&self, now_millis: u64, bound: Duration) -> bool {
        now_millis.saturating_sub(self.refreshed_at_millis) > bound.as_millis() as u64
    }
}

/// Source of pinned-timestamp snapshots.
pub trait PinnedTimestampProvider: Send + Sync {
    /// Returns the current snapshot of the pinned-timestamp registry.
    fn current(&self) -> PinnedTimestamps;
}

impl<F> PinnedTimestampProvider for F
where
    F: Fn() -> PinnedTimestamps + Send + Sync,
{
    fn current(&self) -> PinnedTimestamps {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness() {
        let pins = PinnedTimestamps::new(1_000, []);
        let bound = Duration::from_millis(500);
        assert!(!pins.is_stale(1_200, bound));
        assert!(!pins.is_stale(1_500, bound));
        assert!(pins.is_stale(1_501, bound));
        // A refresh time in the future is not stale.
        assert!(!pins.is_stale(500, bound));
    }

    #[test]
    fn test_provider_from_closure() {
        let provider = || PinnedTimestamps::new(42, [1, 2, 3]);
        let snapshot = PinnedTimestampProvider::current(&provider);
        assert_eq!(snapshot.refreshed_at_millis, 42);
        assert_eq!(snapshot.timestamps.len(), 3);
    }
}
