// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Consistency-checked upload snapshots.
//!
//! A snapshot is an immutable bundle of sealed generations queued for one
//! upload, built from the closed readers just before the transfer. Build-time
//! checks catch WAL corruption before any byte reaches the remote store: the
//! highest generation must equal the requested target, and the generation set
//! must be exactly contiguous. A gap is never tolerated.

use std::collections::BTreeMap;

use tidelog_core::{Checkpoint, Error, Result};

use crate::metadata::TransferMetadata;
use crate::wal::SealedSegment;

/// One generation's files queued for upload.
#[derive(Debug, Clone)]
pub struct SegmentUpload {
    /// Generation being uploaded.
    pub generation: u64,
    /// Primary term the generation was written under.
    pub primary_term: u64,
    /// Checkpoint of the generation.
    pub checkpoint: Checkpoint,
    /// Local path of the data file.
    pub data_path: std::path::PathBuf,
    /// Expected CRC32C of the data file.
    pub data_checksum: u32,
    /// Local path of the checkpoint file.
    pub checkpoint_path: std::path::PathBuf,
    /// Expected CRC32C of the checkpoint file.
    pub checkpoint_checksum: u32,
}

/// An immutable, validated bundle of generations for one upload.
///
/// Exclusively owned by the upload call that created it.
#[derive(Debug)]
pub struct SegmentSnapshot {
    primary_term: u64,
    generation: u64,
    min_generation: u64,
    node_id: String,
    created_at_millis: u64,
    segments: Vec<SegmentUpload>,
}

impl SegmentSnapshot {
    /// Highest generation in the snapshot (the upload target).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Primary term of the upload.
    #[must_use]
    pub fn primary_term(&self) -> u64 {
        self.primary_term
    }

    /// The segments, in ascending generation order.
    #[must_use]
    pub fn segments(&self) -> &[SegmentUpload] {
        &self.segments
    }

    /// The metadata object describing this upload.
    #[must_use]
    pub fn metadata(&self) -> TransferMetadata {
        let generation_to_primary_term: BTreeMap<u64, u64> = self
            .segments
            .iter()
            .filter(|s| s.generation >= self.min_generation)
            .map(|s| (s.generation, s.primary_term))
            .collect();
        TransferMetadata {
            primary_term: self.primary_term,
            generation: self.generation,
            min_generation: self.min_generation,
            file_count: self.segments.len(),
            node_id: self.node_id.clone(),
            created_at_millis: self.created_at_millis,
            generation_to_primary_term,
        }
    }
}

/// Builds a [`SegmentSnapshot`] from the currently closed readers.
#[derive(Debug)]
pub struct SnapshotBuilder<'a> {
    primary_term: u64,
    generation: u64,
    readers: &'a [SealedSegment],
    node_id: &'a str,
}

impl<'a> SnapshotBuilder<'a> {
    /// Creates a builder targeting `(primary_term, generation)`.
    #[must_use]
    pub fn new(
        primary_term: u64,
        generation: u64,
        readers: &'a [SealedSegment],
        node_id: &'a str,
    ) -> Self {
        Self { primary_term, generation, readers, node_id }
    }

    /// Builds and validates the snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvariantViolation`] if the readers do not form a
    /// contiguous generation range ending at the target generation, or if
    /// the highest generation's primary term does not match the target term.
    /// These indicate WAL corruption upstream and abort the upload.
    pub fn build(self) -> Result<SegmentSnapshot> {
        if self.readers.is_empty() {
            return Err(Error::InvariantViolation(
                "cannot build an upload snapshot from zero readers".to_string(),
            ));
        }

        let mut segments = Vec::with_capacity(self.readers.len());
        let mut lowest = u64::MAX;
        let mut highest = 0u64;
        let mut highest_primary_term = 0u64;
        let mut highest_min_generation = 0u64;

        for reader in self.readers {
            if reader.checkpoint.generation != reader.generation {
                return Err(Error::InvariantViolation(format!(
                    "reader generation {} disagrees with its checkpoint generation {}",
                    reader.generation, reader.checkpoint.generation
                )));
            }
            segments.push(SegmentUpload {
                generation: reader.generation,
                primary_term: reader.primary_term,
                checkpoint: reader.checkpoint,
                data_path: reader.data_path.clone(),
                data_checksum: reader.data_checksum,
                checkpoint_path: reader.checkpoint_path.clone(),
                checkpoint_checksum: reader.checkpoint_checksum,
            });
            if reader.generation > highest {
                highest = reader.generation;
                highest_primary_term = reader.primary_term;
                highest_min_generation = reader.checkpoint.min_generation;
            }
            lowest = lowest.min(reader.generation);
        }

        if highest != self.generation {
            return Err(Error::InvariantViolation(format!(
                "highest sealed generation {highest} does not match upload target {}",
                self.generation
            )));
        }
        if highest_primary_term != self.primary_term {
            return Err(Error::InvariantViolation(format!(
                "sealed primary term {highest_primary_term} does not match upload term {}",
                self.primary_term
            )));
        }

        segments.sort_by_key(|s| s.generation);
        let contiguous = segments.windows(2).all(|w| w[1].generation == w[0].generation + 1);
        if !contiguous || segments.len() as u64 != highest - lowest + 1 {
            let found: Vec<u64> = segments.iter().map(|s| s.generation).collect();
            return Err(Error::InvariantViolation(format!(
                "generation gaps found: expected contiguous range [{lowest}, {highest}], got {found:?}"
            )));
        }

        Ok(SegmentSnapshot {
            primary_term: self.primary_term,
            generation: self.generation,
            min_generation: highest_min_generation,
            node_id: self.node_id.to_string(),
            created_at_millis: chrono::Utc::now().timestamp_millis() as u64,
            segments,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn reader(generation: u64, primary_term: u64, min_generation: u64) -> SealedSegment {
        SealedSegment {
            generation,
            primary_term,
            checkpoint: Checkpoint {
                generation,
                min_generation,
                min_seq_no: 0,
                max_seq_no: 10,
                num_ops: 11,
                global_checkpoint: 10,
            },
            data_path: PathBuf::from(format!("wal-{generation}.log")),
            data_checksum: 0,
            checkpoint_path: PathBuf::from(format!("wal-{generation}.ckp")),
            checkpoint_checksum: 0,
        }
    }

    #[test]
    fn test_contiguous_range_builds() {
        let readers = vec![reader(3, 1, 3), reader(4, 1, 3), reader(5, 1, 3)];
        let snapshot = SnapshotBuilder::new(1, 5, &readers, "n1").build().unwrap();
        assert_eq!(snapshot.generation(), 5);
        assert_eq!(snapshot.segments().len(), 3);

        let md = snapshot.metadata();
        assert_eq!(md.min_generation, 3);
        assert_eq!(md.generation_to_primary_term.len(), 3);
    }

    #[test]
    fn test_gap_fails_build() {
        let readers = vec![reader(3, 1, 3), reader(5, 1, 3)];
        let err = SnapshotBuilder::new(1, 5, &readers, "n1").build().unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)), "got {err}");
    }

    #[test]
    fn test_target_mismatch_fails_build() {
        let readers = vec![reader(3, 1, 3), reader(4, 1, 3)];
        let err = SnapshotBuilder::new(1, 5, &readers, "n1").build().unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_primary_term_mismatch_fails_build() {
        let readers = vec![reader(3, 1, 3), reader(4, 2, 3)];
        let err = SnapshotBuilder::new(1, 4, &readers, "n1").build().unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_checkpoint_generation_mismatch_fails_build() {
        let mut bad = reader(4, 1, 3);
        bad.checkpoint.generation = 3;
        let readers = vec![reader(3, 1, 3), bad];
        let err = SnapshotBuilder::new(1, 4, &readers, "n1").build().unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_empty_readers_fail_build() {
        let err = SnapshotBuilder::new(1, 5, &[], "n1").build().unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_mixed_primary_terms_allowed_below_highest() {
        // Generations sealed under an older term stay valid as long as the
        // highest generation carries the current term.
        let readers = vec![reader(3, 1, 3), reader(4, 2, 3)];
        let snapshot = SnapshotBuilder::new(2, 4, &readers, "n1").build().unwrap();
        let md = snapshot.metadata();
        assert_eq!(md.generation_to_primary_term.get(&3), Some(&1));
        assert_eq!(md.generation_to_primary_term.get(&4), Some(&2));
    }
}
