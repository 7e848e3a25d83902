// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Common data types for the remote-mirrored WAL.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sequence number value meaning "no operations have been performed".
pub const NO_OPS_PERFORMED: i64 = -2;

/// File extension for WAL segment data files.
pub const SEGMENT_SUFFIX: &str = ".log";

/// File extension for per-generation checkpoint files.
pub const CHECKPOINT_SUFFIX: &str = ".ckp";

/// Well-known name of the current checkpoint file in a WAL directory.
pub const CURRENT_CHECKPOINT_FILE: &str = "wal.ckp";

/// Identity of one writable shard.
///
/// Generations are unique within a `(ShardId, primary term)` pair; the shard
/// id also scopes the remote prefixes all of its blobs live under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// UUID of the owning index.
    pub index_uid: String,
    /// Shard number within the index.
    pub shard: u32,
}

impl ShardId {
    /// Creates a new shard id.
    pub fn new(index_uid: impl Into<String>, shard: u32) -> Self {
        Self { index_uid: index_uid.into(), shard }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index_uid, self.shard)
    }
}

/// Durable summary record of one WAL generation.
///
/// Owned by the local WAL; read-only to the mirroring engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Generation this checkpoint describes.
    pub generation: u64,
    /// Minimum generation still referenced at the time this was written.
    pub min_generation: u64,
    /// Lowest sequence number in the generation, or [`NO_OPS_PERFORMED`].
    pub min_seq_no: i64,
    /// Highest sequence number in the generation, or [`NO_OPS_PERFORMED`].
    pub max_seq_no: i64,
    /// Number of operations in the generation.
    pub num_ops: u64,
    /// Global checkpoint at the time this was written.
    pub global_checkpoint: i64,
}

impl Checkpoint {
    /// Returns a checkpoint describing an empty WAL at `generation`.
    #[must_use]
    pub fn empty(generation: u64, global_checkpoint: i64) -> Self {
        Self {
            generation,
            min_generation: generation,
            min_seq_no: NO_OPS_PERFORMED,
            max_seq_no: NO_OPS_PERFORMED,
            num_ops: 0,
            global_checkpoint,
        }
    }

    /// True if this checkpoint describes a WAL with no operations at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.generation == self.min_generation
            && self.min_seq_no == NO_OPS_PERFORMED
            && self.max_seq_no == NO_OPS_PERFORMED
            && self.num_ops == 0
    }
}

/// Name of the data file for `generation`.
#[must_use]
pub fn segment_file_name(generation: u64) -> String {
    format!("wal-{generation}{SEGMENT_SUFFIX}")
}

/// Name of the checkpoint file for `generation`.
#[must_use]
pub fn checkpoint_file_name(generation: u64) -> String {
    format!("wal-{generation}{CHECKPOINT_SUFFIX}")
}

/// Parses the generation out of a segment or checkpoint file name.
///
/// Returns `None` for names that do not follow the `wal-<gen>` scheme.
#[must_use]
pub fn parse_generation(file_name: &str) -> Option<u64> {
    let stem = file_name.strip_suffix(SEGMENT_SUFFIX).or_else(|| file_name.strip_suffix(CHECKPOINT_SUFFIX))?;
    stem.strip_prefix("wal-")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_checkpoint() {
        let ckp = Checkpoint::empty(3, -1);
        assert!(ckp.is_empty());

        let non_empty = Checkpoint { num_ops: 1, min_seq_no: 0, max_seq_no: 0, ..ckp };
        assert!(!non_empty.is_empty());

        // A rolled-over checkpoint still referencing an older generation is not empty.
        let rolled = Checkpoint { min_generation: 2, ..ckp };
        assert!(!rolled.is_empty());
    }

    #[test]
    fn test_file_name_round_trip() {
        assert_eq!(segment_file_name(12), "wal-12.log");
        assert_eq!(checkpoint_file_name(12), "wal-12.ckp");
        assert_eq!(parse_generation("wal-12.log"), Some(12));
        assert_eq!(parse_generation("wal-12.ckp"), Some(12));
        assert_eq!(parse_generation("wal.ckp"), None);
        assert_eq!(parse_generation("segment-12.log"), None);
    }

    #[test]
    fn test_shard_id_display() {
        let shard = ShardId::new("abc123", 4);
        assert_eq!(shard.to_string(), "[abc123][4]");
    }
}
