// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Uploads, downloads and remote deletes for one shard's WAL.
//!
//! Upload ordering is the durability contract: all data and checkpoint
//! objects of a snapshot are stored and verified before the metadata object
//! that references them, so a reader that finds a metadata object can trust
//! every generation it names. Deletes run on spawned tasks and report
//! completion through a callback, which the retention planner uses to return
//! its permits.

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use tidelog_core::types::{self, CURRENT_CHECKPOINT_FILE};
use tidelog_core::{Error, Result, ShardId};
use tracing::{debug, error, info, warn};

use crate::blob::{BlobMetadata, BlobStore};
use crate::layout::RemoteLayout;
use crate::metadata::{self, TransferMetadata};
use crate::snapshot::{SegmentSnapshot, SegmentUpload};
use crate::tracker::TransferTracker;
use crate::wal::WalFactory;

/// Blob metadata key carrying a base64 checkpoint, when the store supports
/// attaching metadata to the data object.
const CHECKPOINT_METADATA_KEY: &str = "ckp-data";

/// How a download attempt left the local directory.
#[derive(Debug)]
pub enum DownloadStatus {
    /// The directory now mirrors the newest remote upload.
    Synced(TransferMetadata),
    /// No remote metadata existed; the local directory was kept as-is so it
    /// can seed the first upload.
    LocalRetained,
    /// No remote metadata existed and the local directory held operations it
    /// could not have gotten from the remote store; it was reset to an empty
    /// WAL continuing the same generation lineage.
    ResetToEmpty,
}

/// Moves WAL files between local disk and the remote store.
pub struct TransferManager {
    shard: ShardId,
    store: Arc<dyn BlobStore>,
    layout: RemoteLayout,
    tracker: Arc<TransferTracker>,
    // Decided once at construction. Download still handles both shapes, since
    // older uploads may predate the store gaining metadata support.
    checkpoint_as_metadata: bool,
}

impl TransferManager {
    /// Creates a transfer manager for `shard`.
    #[must_use]
    pub fn new(
        shard: ShardId,
        store: Arc<dyn BlobStore>,
        layout: RemoteLayout,
        tracker: Arc<TransferTracker>,
    ) -> Self {
        let checkpoint_as_metadata = store.supports_blob_metadata();
        Self { shard, store, layout, tracker, checkpoint_as_metadata }
    }

    /// The tracker shared with the coordinator.
    #[must_use]
    pub fn tracker(&self) -> &Arc<TransferTracker> {
        &self.tracker
    }

    /// The remote layout of this shard.
    #[must_use]
    pub fn layout(&self) -> &RemoteLayout {
        &self.layout
    }

    /// Uploads every generation in `snapshot` and then its metadata object.
    ///
    /// Generations the tracker already confirmed uploaded are skipped. Each
    /// file is re-read and its CRC32C compared against the checksum recorded
    /// at seal time; a mismatch aborts the whole upload before the metadata
    /// object is written, so the remote view never references bad bytes.
    pub async fn upload(&self, snapshot: &SegmentSnapshot) -> Result<TransferMetadata> {
        self.tracker.record_snapshot_sizes(snapshot);

        for segment in snapshot.segments() {
            if self.tracker.is_uploaded(segment.generation) {
                debug!(
                    shard = %self.shard,
                    generation = segment.generation,
                    "generation already uploaded, skipping"
                );
                continue;
            }
            match self.upload_segment(segment).await {
                Ok(()) => self.tracker.on_upload_success(segment),
                Err(e) => {
                    self.tracker.on_upload_failure(segment);
                    return Err(e);
                }
            }
        }

        let md = snapshot.metadata();
        let path = self.layout.metadata_path(&md.file_name());
        self.store.put(&path, Bytes::from(md.to_bytes()?)).await?;
        info!(
            shard = %self.shard,
            generation = md.generation,
            primary_term = md.primary_term,
            files = md.file_count,
            "uploaded snapshot"
        );
        Ok(md)
    }

    async fn upload_segment(&self, segment: &SegmentUpload) -> Result<()> {
        let data = read_verified(&segment.data_path, segment.data_checksum).await?;
        let ckp = read_verified(&segment.checkpoint_path, segment.checkpoint_checksum).await?;

        let data_path =
            self.layout.data_path(segment.primary_term, &types::segment_file_name(segment.generation));
        if self.checkpoint_as_metadata {
            let mut attached = BlobMetadata::new();
            attached.insert(CHECKPOINT_METADATA_KEY.to_string(), BASE64.encode(&ckp));
            self.store.put_with_metadata(&data_path, data, attached).await?;
        } else {
            let ckp_path = self
                .layout
                .data_path(segment.primary_term, &types::checkpoint_file_name(segment.generation));
            self.store.put(&ckp_path, ckp).await?;
            self.store.put(&data_path, data).await?;
        }
        debug!(shard = %self.shard, generation = segment.generation, "uploaded generation");
        Ok(())
    }

    /// Lists all metadata object names, newest first.
    pub async fn list_metadata_files(&self) -> Result<Vec<String>> {
        let prefix = self.layout.metadata_prefix();
        let entries = self.store.list(prefix).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| e.path.strip_prefix(prefix).map(str::to_string))
            .collect())
    }

    /// Reads the newest metadata object, or the newest one created at or
    /// before `as_of` (epoch millis) when given.
    ///
    /// Returns `None` when no (matching) metadata object exists.
    pub async fn read_metadata(
        &self,
        as_of: Option<u64>,
    ) -> Result<Option<(String, TransferMetadata)>> {
        let files = self.list_metadata_files().await?;
        let chosen = match as_of {
            None => files.into_iter().next(),
            Some(bound) => {
                let mut pick = None;
                for name in files {
                    if metadata::parse_timestamp(&name)? <= bound {
                        pick = Some(name);
                        break;
                    }
                }
                pick
            }
        };
        match chosen {
            Some(name) => {
                let md = self.read_metadata_file(&name).await?;
                Ok(Some((name, md)))
            }
            None => Ok(None),
        }
    }

    /// Reads and decodes one metadata object by name.
    pub async fn read_metadata_file(&self, file_name: &str) -> Result<TransferMetadata> {
        let path = self.layout.metadata_path(file_name);
        let bytes = self.store.get(&path).await?;
        TransferMetadata::from_bytes(&path, &bytes)
    }

    /// Populates `location` from the remote store.
    ///
    /// Retries the whole flow up to `max_retries` times when a blob vanishes
    /// mid-download; a concurrent primary relocation may delete generations
    /// between the metadata read and the file fetches, and a fresh metadata
    /// read resolves to the new upload.
    pub async fn download(
        &self,
        wal: &dyn WalFactory,
        location: &Path,
        seed_remote: bool,
        max_retries: u32,
    ) -> Result<DownloadStatus> {
        let mut attempt = 0;
        loop {
            match self.download_once(wal, location, seed_remote).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_not_found() && attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        shard = %self.shard,
                        attempt,
                        error = %e,
                        "blob disappeared during download, restarting"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_once(
        &self,
        wal: &dyn WalFactory,
        location: &Path,
        seed_remote: bool,
    ) -> Result<DownloadStatus> {
        tokio::fs::create_dir_all(location).await?;

        let Some((name, md)) = self.read_metadata(None).await? else {
            return self.handle_no_remote_metadata(wal, location, seed_remote);
        };
        debug!(shard = %self.shard, metadata = %name, "downloading remote WAL");

        clear_wal_files(location).await?;

        // Descending order: if the download dies partway, the files present
        // locally are the newest ones, which recovery prefers.
        let mut highest_ckp: Option<Vec<u8>> = None;
        for (&generation, &primary_term) in md.generation_to_primary_term.iter().rev() {
            let ckp = self.download_generation(location, primary_term, generation).await?;
            if highest_ckp.is_none() {
                highest_ckp = Some(ckp);
            }
        }

        // The highest generation's checkpoint becomes the live one.
        if let Some(ckp) = highest_ckp {
            tokio::fs::write(location.join(CURRENT_CHECKPOINT_FILE), ckp).await?;
        }

        info!(
            shard = %self.shard,
            generation = md.generation,
            min_generation = md.min_generation,
            "downloaded remote WAL"
        );
        Ok(DownloadStatus::Synced(md))
    }

    /// Fetches one generation's data and checkpoint files into `location`.
    /// Returns the checkpoint file bytes.
    async fn download_generation(
        &self,
        location: &Path,
        primary_term: u64,
        generation: u64,
    ) -> Result<Vec<u8>> {
        let data_name = types::segment_file_name(generation);
        let ckp_name = types::checkpoint_file_name(generation);
        let data_path = self.layout.data_path(primary_term, &data_name);

        let (data, attached) = self.store.get_with_metadata(&data_path).await?;
        let ckp = match attached.get(CHECKPOINT_METADATA_KEY) {
            Some(encoded) => BASE64.decode(encoded).map_err(|e| Error::Decode {
                path: data_path.clone(),
                reason: format!("invalid base64 checkpoint metadata: {e}"),
            })?,
            None => {
                let ckp_path = self.layout.data_path(primary_term, &ckp_name);
                self.store.get(&ckp_path).await?.to_vec()
            }
        };

        tokio::fs::write(location.join(&data_name), &data).await?;
        tokio::fs::write(location.join(&ckp_name), &ckp).await?;
        Ok(ckp)
    }

    fn handle_no_remote_metadata(
        &self,
        wal: &dyn WalFactory,
        location: &Path,
        seed_remote: bool,
    ) -> Result<DownloadStatus> {
        if seed_remote {
            // First primary of the shard: local files are the source of
            // truth and will seed the first upload.
            debug!(shard = %self.shard, "no remote metadata, retaining local WAL for seeding");
            return Ok(DownloadStatus::LocalRetained);
        }
        match wal.read_checkpoint(location)? {
            Some(ckp) if !ckp.is_empty() => {
                // Operations exist locally that the remote store never saw.
                // They cannot be trusted, so the WAL restarts empty on the
                // same generation lineage.
                warn!(
                    shard = %self.shard,
                    generation = ckp.generation,
                    "no remote metadata but local WAL is non-empty, resetting to empty"
                );
                wal.create_empty(location, &ckp)?;
                Ok(DownloadStatus::ResetToEmpty)
            }
            _ => Ok(DownloadStatus::LocalRetained),
        }
    }

    /// Deletes the remote files of `generations` on a background task.
    ///
    /// `on_done` runs exactly once, after the delete finishes or fails.
    /// Failures are logged and left for a later sweep to retry.
    pub fn delete_generations_async(
        self: &Arc<Self>,
        primary_term: u64,
        generations: Vec<u64>,
        on_done: impl FnOnce() + Send + 'static,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut paths = Vec::with_capacity(generations.len() * 2);
            for &generation in &generations {
                paths.push(
                    this.layout.data_path(primary_term, &types::segment_file_name(generation)),
                );
                paths.push(
                    this.layout.data_path(primary_term, &types::checkpoint_file_name(generation)),
                );
            }
            match this.store.delete(&paths).await {
                Ok(()) => {
                    debug!(
                        shard = %this.shard,
                        primary_term,
                        count = generations.len(),
                        "deleted stale remote generations"
                    );
                    this.tracker.remove_generations(generations);
                }
                Err(e) => {
                    error!(shard = %this.shard, error = %e, "failed to delete remote generations");
                }
            }
            on_done();
        });
    }

    /// Deletes metadata objects on a background task.
    ///
    /// `on_done` runs exactly once, after the delete finishes or fails.
    pub fn delete_metadata_files_async(
        self: &Arc<Self>,
        file_names: Vec<String>,
        on_done: impl FnOnce() + Send + 'static,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let paths: Vec<String> =
                file_names.iter().map(|name| this.layout.metadata_path(name)).collect();
            match this.store.delete(&paths).await {
                Ok(()) => {
                    debug!(
                        shard = %this.shard,
                        count = file_names.len(),
                        "deleted stale metadata files"
                    );
                }
                Err(e) => {
                    error!(shard = %this.shard, error = %e, "failed to delete metadata files");
                }
            }
            on_done();
        });
    }

    /// Deletes every data object stored under a primary term older than
    /// `minimum_term`, on a background task.
    pub fn delete_primary_terms_async(self: &Arc<Self>, minimum_term: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let entries = match this.store.list(this.layout.data_prefix()).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!(shard = %this.shard, error = %e, "failed to list primary terms");
                    return;
                }
            };
            let mut stale: Vec<u64> = entries
                .iter()
                .filter_map(|e| this.layout.parse_primary_term(&e.path))
                .filter(|term| *term < minimum_term)
                .collect();
            stale.sort_unstable();
            stale.dedup();
            for term in stale {
                let prefix = this.layout.primary_term_prefix(term);
                match this.store.delete_prefix(&prefix).await {
                    Ok(()) => {
                        info!(shard = %this.shard, primary_term = term, "deleted stale primary term")
                    }
                    Err(e) => {
                        error!(
                            shard = %this.shard,
                            primary_term = term,
                            error = %e,
                            "failed to delete stale primary term"
                        );
                    }
                }
            }
        });
    }

    /// Deletes everything this shard stored remotely. Used when the index is
    /// deleted outright.
    pub async fn delete_all(&self) -> Result<()> {
        self.store.delete_prefix(self.layout.data_prefix()).await?;
        self.store.delete_prefix(self.layout.metadata_prefix()).await?;
        self.tracker.clear();
        info!(shard = %self.shard, "deleted all remote WAL state");
        Ok(())
    }
}

impl std::fmt::Debug for TransferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferManager")
            .field("shard", &self.shard)
            .field("checkpoint_as_metadata", &self.checkpoint_as_metadata)
            .finish_non_exhaustive()
    }
}

/// Reads a local file and verifies it against the checksum recorded at seal
/// time.
async fn read_verified(path: &Path, expected: u32) -> Result<Bytes> {
    let data = tokio::fs::read(path).await?;
    let actual = crc32c::crc32c(&data);
    if actual != expected {
        return Err(Error::Corruption {
            file: path.display().to_string(),
            expected,
            actual,
        });
    }
    Ok(Bytes::from(data))
}

/// Removes all WAL segment, checkpoint and current-checkpoint files from
/// `location`, leaving unrelated files alone.
async fn clear_wal_files(location: &Path) -> Result<()> {
    let mut dir = tokio::fs::read_dir(location).await?;
    while let Some(entry) = dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == CURRENT_CHECKPOINT_FILE || types::parse_generation(name).is_some() {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}
