// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Remote mirroring, recovery and retention for the Tidelog WAL.
//!
//! The local WAL stays the write path; this crate mirrors every sealed
//! generation to a blob store and makes the remote copy the recovery source
//! of truth. The main entry point is [`RemoteWal`]:
//!
//! - [`RemoteWal::sync`] seals the active generation and uploads it together
//!   with any earlier un-uploaded generations, then publishes a metadata
//!   object naming them. Syncs are single-flight; losing the race is a
//!   skipped outcome, not an error.
//! - [`RemoteWal::open`] recovers a shard by downloading the newest upload.
//! - [`RemoteWal::trim_unreferenced_readers`] removes local generations whose
//!   upload is confirmed and sweeps stale remote state, honoring pinned
//!   timestamps.
//! - [`RemoteWal::drain_sync`] pauses the whole machinery for a primary
//!   handoff.
//!
//! The blob store and the local WAL implementation are both seams
//! ([`BlobStore`], [`wal::WalFactory`]) so embedders bring their own.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blob;
pub mod layout;
pub mod metadata;
pub mod retention;
pub mod snapshot;
pub mod tracker;
pub mod transfer;
pub mod sync;
pub mod wal;

pub use blob::{BlobEntry, BlobMetadata, BlobStore, InMemoryBlobStore};
pub use layout::RemoteLayout;
pub use metadata::TransferMetadata;
pub use retention::{RetentionPlanner, SkipReason, SweepContext, SweepOutcome};
pub use snapshot::{SegmentSnapshot, SegmentUpload, SnapshotBuilder};
pub use sync::{DrainGuard, RemoteWal, RemoteWalOptions};
pub use tracker::{TrackerStats, TransferTracker};
pub use transfer::{DownloadStatus, TransferManager};
pub use wal::{SealedSegment, WalFactory, WalState, WalWriter};
