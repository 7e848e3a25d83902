// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! The sync coordinator: the public face of the remote-mirrored WAL.
//!
//! Every durability round trip goes through [`RemoteWal`]: seal the active
//! generation, upload it together with any earlier un-uploaded generations,
//! and publish a metadata object naming them. A single sync permit makes the
//! round trip single-flight; a caller that loses the race gets `Ok(false)`
//! and retries on its own schedule, it is never an error.
//!
//! Sealing happens under the write lock, the upload under the read lock, so
//! appends to the new active generation proceed while bytes move to the
//! remote store. Between the two lock scopes there is a window where another
//! sync could observe the sealed generation; the sync permit is what keeps a
//! second upload from starting inside that window.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tidelog_core::{
    Error, PinnedTimestampProvider, RemoteWalConfig, Result, ShardId,
};
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::blob::BlobStore;
use crate::layout::RemoteLayout;
use crate::retention::{RetentionPlanner, SkipReason, SweepContext, SweepOutcome};
use crate::snapshot::SnapshotBuilder;
use crate::tracker::{TrackerStats, TransferTracker};
use crate::transfer::{DownloadStatus, TransferManager};
use crate::wal::{WalFactory, WalState};

/// Generation watermark value meaning "nothing uploaded yet".
const NO_GENERATION: u64 = 0;

/// How to open a [`RemoteWal`].
#[derive(Debug, Clone)]
pub struct RemoteWalOptions {
    /// Identity of the shard.
    pub shard: ShardId,
    /// Engine configuration.
    pub config: RemoteWalConfig,
    /// Remote path prefix all of this cluster's blobs live under.
    pub base_path: String,
    /// Local directory holding the WAL files.
    pub location: PathBuf,
    /// True when this shard is becoming the first primary of its lifecycle:
    /// local WAL files are kept even if the remote store is empty, and will
    /// seed the first upload.
    pub seed_remote: bool,
}

/// Holds all syncs paused during a primary handoff.
///
/// Dropping the guard (or calling [`DrainGuard::release`]) resumes syncs;
/// release is idempotent.
#[derive(Debug)]
pub struct DrainGuard {
    permit: Option<OwnedSemaphorePermit>,
    pause: Arc<AtomicBool>,
}

impl DrainGuard {
    /// Resumes syncs. Equivalent to dropping the guard.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(permit) = self.permit.take() {
            drop(permit);
            self.pause.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// A node-local WAL mirrored to a remote blob store.
pub struct RemoteWal {
    shard: ShardId,
    config: RemoteWalConfig,
    wal: Arc<dyn WalFactory>,
    state: RwLock<WalState>,
    transfer: Arc<TransferManager>,
    tracker: Arc<TransferTracker>,
    retention: RetentionPlanner,
    sync_permit: Arc<Semaphore>,
    pause_sync: Arc<AtomicBool>,
    closed: AtomicBool,
    /// Highest generation whose upload was confirmed, [`NO_GENERATION`] if none.
    max_uploaded_generation: AtomicU64,
    /// `min_generation` of the last uploaded metadata object.
    min_remote_referenced: AtomicU64,
    primary_term: Box<dyn Fn() -> u64 + Send + Sync>,
    started_primary: Box<dyn Fn() -> bool + Send + Sync>,
}

impl RemoteWal {
    /// Opens the WAL at `options.location`, recovering it from the remote
    /// store first.
    ///
    /// `primary_term` supplies the current term on every sync; `started_primary`
    /// reports whether the shard is an active primary, which gates retention.
    pub async fn open(
        options: RemoteWalOptions,
        store: Arc<dyn BlobStore>,
        wal: Arc<dyn WalFactory>,
        pins: Arc<dyn PinnedTimestampProvider>,
        primary_term: impl Fn() -> u64 + Send + Sync + 'static,
        started_primary: impl Fn() -> bool + Send + Sync + 'static,
    ) -> Result<Self> {
        let RemoteWalOptions { shard, config, base_path, location, seed_remote } = options;

        let layout = RemoteLayout::new(&base_path, &shard);
        let tracker = Arc::new(TransferTracker::new(shard.clone()));
        let transfer = Arc::new(TransferManager::new(
            shard.clone(),
            store,
            layout,
            Arc::clone(&tracker),
        ));

        let status = transfer
            .download(wal.as_ref(), &location, seed_remote, config.download_retries)
            .await?;

        let mut max_uploaded = NO_GENERATION;
        let mut min_remote = NO_GENERATION;
        if let DownloadStatus::Synced(md) = &status {
            max_uploaded = md.generation;
            min_remote = md.min_generation;
            for &generation in md.generation_to_primary_term.keys() {
                tracker.mark_uploaded(generation);
            }
        }

        let (readers, writer) = wal.open_local(&location)?;
        if readers.is_empty() {
            return Err(Error::InvariantViolation(
                "local recovery produced no sealed generations".to_string(),
            ));
        }
        info!(
            shard = %shard,
            readers = readers.len(),
            generation = writer.generation(),
            "opened remote WAL"
        );

        let retention = RetentionPlanner::new(
            shard.clone(),
            Arc::clone(&transfer),
            pins,
            config.clone(),
        );

        Ok(Self {
            shard,
            config,
            wal,
            state: RwLock::new(WalState::new(readers, writer)),
            transfer,
            tracker,
            retention,
            sync_permit: Arc::new(Semaphore::new(1)),
            pause_sync: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
            max_uploaded_generation: AtomicU64::new(max_uploaded),
            min_remote_referenced: AtomicU64::new(min_remote),
            primary_term: Box::new(primary_term),
            started_primary: Box::new(started_primary),
        })
    }

    /// Generation of the active writer.
    pub async fn current_generation(&self) -> Result<u64> {
        Ok(self.state.read().await.writer()?.generation())
    }

    /// Highest generation confirmed uploaded, or `None` before the first
    /// upload.
    #[must_use]
    pub fn max_uploaded_generation(&self) -> Option<u64> {
        match self.max_uploaded_generation.load(Ordering::SeqCst) {
            NO_GENERATION => None,
            generation => Some(generation),
        }
    }

    /// Upload counters.
    #[must_use]
    pub fn stats(&self) -> TrackerStats {
        self.tracker.stats()
    }

    /// True if a sync would have work to do: un-synced operations in the
    /// active generation, or an empty generation whose predecessors have not
    /// all been confirmed uploaded.
    pub async fn sync_needed(&self) -> bool {
        let state = self.state.read().await;
        let Ok(writer) = state.writer() else { return false };
        if writer.sync_needed() {
            return true;
        }
        let max_uploaded = self.max_uploaded_generation.load(Ordering::SeqCst);
        max_uploaded + 1 < writer.generation() && writer.num_ops() == 0
    }

    /// True if uploads are outpacing flushes and the owner should flush to
    /// let the local trim make progress.
    pub async fn should_flush(&self) -> bool {
        let Some(max_readers) = self.config.max_uploaded_readers else { return false };
        self.state.read().await.readers.len() >= max_readers
    }

    /// Makes the WAL durable remotely.
    ///
    /// Returns `Ok(false)` if another sync was already in flight; the remote
    /// store is then at most one round trip behind and the caller may retry.
    pub async fn sync(&self) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        if !self.sync_needed().await {
            return Ok(true);
        }
        self.prepare_and_upload(None).await
    }

    /// Ensures every operation up to and including `generation` is durable
    /// remotely.
    ///
    /// Returns `Ok(false)` without uploading when `generation` is below the
    /// active one: it was already superseded by a roll, and any upload it
    /// still needs rides along with the next sync of the active generation.
    pub async fn ensure_synced(&self, generation: u64) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let current = self.current_generation().await?;
        if generation < current {
            return Ok(false);
        }
        self.prepare_and_upload(Some(generation)).await
    }

    /// Seals the active generation and uploads it.
    ///
    /// An empty writer under an unchanged term is left alone, so repeated
    /// rolls do not mint empty generations.
    pub async fn roll_generation(&self) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        {
            let state = self.state.read().await;
            let writer = state.writer()?;
            if writer.num_ops() == 0 && writer.primary_term() == (self.primary_term)() {
                return Ok(true);
            }
        }
        self.prepare_and_upload(None).await
    }

    async fn prepare_and_upload(&self, target: Option<u64>) -> Result<bool> {
        // Only a started primary may upload. A relocating primary that has
        // not confirmed the handoff would race the old primary's uploads.
        if !(self.started_primary)() {
            debug!(shard = %self.shard, "not started as primary, skipping sync");
            return Ok(false);
        }
        let Ok(_permit) = Arc::clone(&self.sync_permit).try_acquire_owned() else {
            debug!(shard = %self.shard, "sync already in flight, skipping");
            return Ok(false);
        };
        self.seal_and_upload(target).await?;
        Ok(true)
    }

    /// The sealed round trip. Caller must hold the sync permit.
    async fn seal_and_upload(&self, target: Option<u64>) -> Result<()> {
        let term = (self.primary_term)();
        {
            let mut state = self.state.write().await;
            let writer_generation = state.writer()?.generation();
            // A target below the active generation was sealed by an earlier
            // sync; only its upload may still be pending.
            if target.map_or(true, |t| t == writer_generation) {
                let writer = state.writer.take().ok_or(Error::Closed)?;
                match writer.seal() {
                    Ok(sealed) => state.readers.push(sealed),
                    Err(e) => {
                        // The writer is gone and cannot be recreated safely.
                        self.closed.store(true, Ordering::SeqCst);
                        warn!(shard = %self.shard, error = %e, "seal failed, closing WAL");
                        return Err(e);
                    }
                }
                if !self.closed.load(Ordering::SeqCst) {
                    match self.wal.create_writer(writer_generation + 1, term) {
                        Ok(writer) => state.writer = Some(writer),
                        Err(e) => {
                            self.closed.store(true, Ordering::SeqCst);
                            warn!(shard = %self.shard, error = %e, "writer rotation failed, closing WAL");
                            return Err(e);
                        }
                    }
                }
            }
        }

        // Lock downgrade: appends resume while the upload runs.
        let state = self.state.read().await;
        let Some(max_sealed) = state.readers.iter().map(|r| r.generation).max() else {
            return Ok(());
        };
        let snapshot =
            SnapshotBuilder::new(term, max_sealed, &state.readers, &self.config.node_id).build()?;
        let md = self.transfer.upload(&snapshot).await?;
        self.max_uploaded_generation.store(md.generation, Ordering::SeqCst);
        self.min_remote_referenced.store(md.min_generation, Ordering::SeqCst);
        Ok(())
    }

    /// Pauses syncs for a primary handoff, waiting out any in-flight sync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DrainTimeout`] if the in-flight sync does not finish
    /// within the configured bound; the handoff must then be aborted.
    pub async fn drain_sync(&self) -> Result<DrainGuard> {
        let acquire = Arc::clone(&self.sync_permit).acquire_owned();
        match timeout(self.config.drain_timeout(), acquire).await {
            Ok(Ok(permit)) => {
                self.pause_sync.store(true, Ordering::SeqCst);
                debug!(shard = %self.shard, "syncs drained and paused");
                Ok(DrainGuard { permit: Some(permit), pause: Arc::clone(&self.pause_sync) })
            }
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                Err(Error::DrainTimeout { timeout_ms: self.config.drain_timeout_ms })
            }
        }
    }

    /// Trims local generations no longer needed for recovery, then sweeps
    /// the remote store.
    ///
    /// Local files are only removed once their upload is confirmed. The
    /// remote sweep is skipped while the shard is not an active primary,
    /// while syncs are paused for a handoff, and after close, unless the
    /// whole index was deleted.
    pub async fn trim_unreferenced_readers(&self, index_deleted: bool) -> Result<SweepOutcome> {
        {
            let mut state = self.state.write().await;
            let writer_generation = match state.writer() {
                Ok(writer) => writer.generation(),
                // Closed: nothing local left to trim against.
                Err(_) => state.readers.iter().map(|r| r.generation).max().unwrap_or(0) + 1,
            };
            let min_required = self.wal.min_generation_required(&state.readers, writer_generation);

            let readers = std::mem::take(&mut state.readers);
            for reader in readers {
                // Local files survive until their upload is confirmed; the
                // remote copy is the only other one.
                if reader.generation >= min_required || !self.tracker.is_uploaded(reader.generation)
                {
                    state.readers.push(reader);
                    continue;
                }
                debug!(
                    shard = %self.shard,
                    generation = reader.generation,
                    "removing local generation"
                );
                for path in [&reader.data_path, &reader.checkpoint_path] {
                    if let Err(e) = std::fs::remove_file(path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!(shard = %self.shard, path = %path.display(), error = %e, "could not remove local file");
                        }
                    }
                }
            }
            let min_live = state.min_live_generation().unwrap_or(writer_generation);
            self.tracker.prune_below(min_live);
        }

        if !index_deleted
            && (!(self.started_primary)()
                || self.pause_sync.load(Ordering::SeqCst)
                || self.closed.load(Ordering::SeqCst))
        {
            return Ok(SweepOutcome::Skipped(SkipReason::NotActive));
        }

        let min_remote_referenced = self.min_remote_referenced.load(Ordering::SeqCst);
        if min_remote_referenced == NO_GENERATION {
            return Ok(SweepOutcome::Skipped(SkipReason::NothingEligible));
        }
        self.retention
            .sweep(SweepContext {
                index_deleted,
                min_referenced_generation: min_remote_referenced,
                primary_term: (self.primary_term)(),
            })
            .await
    }

    /// Closes the WAL: waits out any in-flight sync, then seals and uploads
    /// the active generation one last time. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Ok(());
        }
        let acquire = Arc::clone(&self.sync_permit).acquire_owned();
        let _permit = match timeout(self.config.drain_timeout(), acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Ok(()),
            Err(_) => {
                return Err(Error::DrainTimeout { timeout_ms: self.config.drain_timeout_ms })
            }
        };
        self.seal_and_upload(None).await?;
        info!(shard = %self.shard, "closed remote WAL");
        Ok(())
    }

    /// Deletes everything this shard stored remotely. For index deletion.
    pub async fn delete_remote(&self) -> Result<()> {
        self.transfer.delete_all().await
    }
}

impl std::fmt::Debug for RemoteWal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteWal")
            .field("shard", &self.shard)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
