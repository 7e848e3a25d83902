// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Bookkeeping of which generations and files are confirmed uploaded.
//!
//! Owned by one WAL instance. Entries are mutated only by upload and delete
//! callbacks and by the trim pass, which are serialized against each other by
//! the sync and deletion permits, so atomic map operations are sufficient.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tidelog_core::ShardId;
use tracing::debug;

use crate::snapshot::{SegmentSnapshot, SegmentUpload};

/// Outcome of the last transfer attempt for a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// The generation's files are durably in the remote store.
    Uploaded,
    /// The last upload attempt failed; the generation will be retried.
    Failed,
}

/// Snapshot of tracker counters, for the statistics surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    /// Generations currently marked uploaded.
    pub uploaded_generations: usize,
    /// Files with a recorded content length.
    pub tracked_files: usize,
    /// Total bytes confirmed uploaded over the tracker's lifetime.
    pub uploaded_bytes: u64,
    /// Upload attempts that failed over the tracker's lifetime.
    pub failed_uploads: u64,
}

/// Tracks per-generation upload outcomes and per-file content lengths.
#[derive(Debug)]
pub struct TransferTracker {
    shard: ShardId,
    generations: DashMap<u64, TransferState>,
    file_sizes: DashMap<String, u64>,
    uploaded_bytes: AtomicU64,
    failed_uploads: AtomicU64,
}

impl TransferTracker {
    /// Creates an empty tracker for `shard`.
    #[must_use]
    pub fn new(shard: ShardId) -> Self {
        Self {
            shard,
            generations: DashMap::new(),
            file_sizes: DashMap::new(),
            uploaded_bytes: AtomicU64::new(0),
            failed_uploads: AtomicU64::new(0),
        }
    }

    /// Records the content lengths of every file in `snapshot`.
    pub fn record_snapshot_sizes(&self, snapshot: &SegmentSnapshot) {
        for segment in snapshot.segments() {
            for path in [&segment.data_path, &segment.checkpoint_path] {
                if let (Some(name), Ok(meta)) =
                    (path.file_name().and_then(|n| n.to_str()), std::fs::metadata(path))
                {
                    self.file_sizes.insert(name.to_string(), meta.len());
                }
            }
        }
    }

    /// Marks a generation as durably uploaded.
    pub fn on_upload_success(&self, segment: &SegmentUpload) {
        self.generations.insert(segment.generation, TransferState::Uploaded);
        let bytes: u64 = [&segment.data_path, &segment.checkpoint_path]
            .iter()
            .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
            .filter_map(|name| self.file_sizes.get(name).map(|s| *s))
            .sum();
        self.uploaded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Marks a generation uploaded without an upload having run, for
    /// generations recovered from the remote store during download.
    pub fn mark_uploaded(&self, generation: u64) {
        self.generations.insert(generation, TransferState::Uploaded);
    }

    /// Marks a generation's last upload attempt as failed.
    pub fn on_upload_failure(&self, segment: &SegmentUpload) {
        self.generations.insert(segment.generation, TransferState::Failed);
        self.failed_uploads.fetch_add(1, Ordering::Relaxed);
    }

    /// True if the generation is already confirmed uploaded, so the transfer
    /// path can skip it instead of re-uploading.
    #[must_use]
    pub fn is_uploaded(&self, generation: u64) -> bool {
        matches!(self.generations.get(&generation).map(|e| *e), Some(TransferState::Uploaded))
    }

    /// All generations currently marked uploaded, ascending.
    #[must_use]
    pub fn all_uploaded(&self) -> Vec<u64> {
        let mut uploaded: Vec<u64> = self
            .generations
            .iter()
            .filter(|e| *e.value() == TransferState::Uploaded)
            .map(|e| *e.key())
            .collect();
        uploaded.sort_unstable();
        uploaded
    }

    /// Drops bookkeeping for generations below `min_live_generation`.
    ///
    /// Called after the local trim pass: once a generation's local files are
    /// gone it no longer needs redundancy tracking, even if its remote copy
    /// still exists.
    pub fn prune_below(&self, min_live_generation: u64) {
        let stale: Vec<u64> = self
            .generations
            .iter()
            .map(|e| *e.key())
            .filter(|g| *g < min_live_generation)
            .collect();
        if stale.is_empty() {
            return;
        }
        debug!(shard = %self.shard, count = stale.len(), "pruning stale tracker entries");
        for generation in stale {
            self.forget_generation(generation);
        }
    }

    /// Drops bookkeeping for generations whose remote deletion completed.
    pub fn remove_generations(&self, generations: impl IntoIterator<Item = u64>) {
        for generation in generations {
            self.forget_generation(generation);
        }
    }

    /// Clears the tracker entirely, after full remote cleanup.
    pub fn clear(&self) {
        self.generations.clear();
        self.file_sizes.clear();
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            uploaded_generations: self
                .generations
                .iter()
                .filter(|e| *e.value() == TransferState::Uploaded)
                .count(),
            tracked_files: self.file_sizes.len(),
            uploaded_bytes: self.uploaded_bytes.load(Ordering::Relaxed),
            failed_uploads: self.failed_uploads.load(Ordering::Relaxed),
        }
    }

    fn forget_generation(&self, generation: u64) {
        self.generations.remove(&generation);
        self.file_sizes.remove(&tidelog_core::types::segment_file_name(generation));
        self.file_sizes.remove(&tidelog_core::types::checkpoint_file_name(generation));
    }
}
