// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Local WAL seam.
//!
//! The segment format, writer implementation and deletion policy are owned by
//! the local WAL; this module defines the narrow interface the mirroring
//! engine consumes. A sealed segment exposes its files and the checksums
//! recorded when it was sealed, so uploads can verify integrity end to end.

use std::path::{Path, PathBuf};

use tidelog_core::{Checkpoint, Error, Result};

/// One closed, immutable WAL generation on local disk.
#[derive(Debug, Clone)]
pub struct SealedSegment {
    /// Generation of this segment.
    pub generation: u64,
    /// Primary term the segment was written under.
    pub primary_term: u64,
    /// Checkpoint summarizing the segment.
    pub checkpoint: Checkpoint,
    /// Path of the segment data file.
    pub data_path: PathBuf,
    /// CRC32C of the data file, recorded at seal time.
    pub data_checksum: u32,
    /// Path of the per-generation checkpoint file.
    pub checkpoint_path: PathBuf,
    /// CRC32C of the checkpoint file, recorded at seal time.
    pub checkpoint_checksum: u32,
}

/// The active writer of the local WAL.
///
/// Only the operations the mirroring engine needs; appends happen elsewhere.
pub trait WalWriter: Send + Sync {
    /// Generation the writer is producing.
    fn generation(&self) -> u64;

    /// Primary term the writer was created under.
    fn primary_term(&self) -> u64;

    /// Number of operations written to the active generation so far.
    fn num_ops(&self) -> u64;

    /// Fsync the active generation. Returns true if anything was written
    /// since the last sync.
    fn sync(&mut self) -> Result<bool>;

    /// True if there are un-synced operations in the active generation.
    fn sync_needed(&self) -> bool;

    /// Seals the writer into an immutable segment, persisting its
    /// per-generation checkpoint file next to the data file.
    fn seal(self: Box<Self>) -> Result<SealedSegment>;
}

/// Factory and policy surface of the local WAL.
pub trait WalFactory: Send + Sync {
    /// Creates the writer for `generation` under `primary_term`.
    fn create_writer(&self, generation: u64, primary_term: u64) -> Result<Box<dyn WalWriter>>;

    /// Recovers the sealed segments and the next writer from `location`.
    ///
    /// Called once, after [`crate::transfer::TransferManager::download`] has
    /// populated the directory.
    fn open_local(&self, location: &Path) -> Result<(Vec<SealedSegment>, Box<dyn WalWriter>)>;

    /// Replaces whatever is at `location` with an empty WAL that continues
    /// from `prior` (same generation lineage, no operations).
    fn create_empty(&self, location: &Path, prior: &Checkpoint) -> Result<()>;

    /// Reads the current checkpoint at `location`, if one exists.
    fn read_checkpoint(&self, location: &Path) -> Result<Option<Checkpoint>>;

    /// The minimum generation recovery still needs, per the deletion policy.
    fn min_generation_required(&self, readers: &[SealedSegment], writer_generation: u64) -> u64;
}

/// Mutable local state of one shard's WAL: the closed readers plus the
/// active writer.
///
/// Protected by the coordinator's read/write lock; the writer slot is empty
/// only after the final seal during close.
pub struct WalState {
    /// Sealed segments in ascending generation order.
    pub readers: Vec<SealedSegment>,
    /// The active writer, if the WAL is still open.
    pub writer: Option<Box<dyn WalWriter>>,
}

impl WalState {
    /// Creates the state from recovery output.
    #[must_use]
    pub fn new(readers: Vec<SealedSegment>, writer: Box<dyn WalWriter>) -> Self {
        Self { readers, writer: Some(writer) }
    }

    /// The active writer, or [`Error::Closed`] after the final seal.
    pub fn writer(&self) -> Result<&dyn WalWriter> {
        self.writer.as_deref().ok_or(Error::Closed)
    }

    /// Mutable access to the active writer.
    pub fn writer_mut(&mut self) -> Result<&mut (dyn WalWriter + '_)> {
        match self.writer.as_deref_mut() {
            Some(writer) => Ok(writer),
            None => Err(Error::Closed),
        }
    }

    /// Lowest generation among the sealed segments.
    #[must_use]
    pub fn min_live_generation(&self) -> Option<u64> {
        self.readers.iter().map(|r| r.generation).min()
    }
}

impl std::fmt::Debug for WalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalState")
            .field("readers", &self.readers.len())
            .field("writer_generation", &self.writer.as_ref().map(|w| w.generation()))
            .finish()
    }
}
