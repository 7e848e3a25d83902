// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Test doubles: a file-backed mock WAL and fault-injecting blob stores.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tidelog_core::types::{self, CURRENT_CHECKPOINT_FILE};
use tidelog_core::{
    Checkpoint, Error, PinnedTimestampProvider, PinnedTimestamps, RemoteWalConfig, Result, ShardId,
    NO_OPS_PERFORMED,
};
use tidelog_remote::{
    BlobEntry, BlobMetadata, BlobStore, InMemoryBlobStore, RemoteWal, RemoteWalOptions,
    SealedSegment, WalFactory, WalWriter,
};

/// A minimal file-backed WAL: operations are strings, a segment file is the
/// JSON list of them, a checkpoint file is the JSON checkpoint.
pub struct MockWalFactory {
    dir: PathBuf,
    primary_term: AtomicU64,
    /// Minimum generation local recovery still needs. Zero means "nothing",
    /// i.e. every sealed generation is trimmable once uploaded.
    min_required: AtomicU64,
    current: Mutex<Option<Arc<Mutex<WriterInner>>>>,
    reset_called: AtomicBool,
}

struct WriterInner {
    dir: PathBuf,
    generation: u64,
    primary_term: u64,
    ops: Vec<String>,
    dirty: bool,
}

pub struct MockWriter {
    inner: Arc<Mutex<WriterInner>>,
}

impl MockWalFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.into(),
            primary_term: AtomicU64::new(1),
            min_required: AtomicU64::new(0),
            current: Mutex::new(None),
            reset_called: AtomicBool::new(false),
        })
    }

    pub fn set_primary_term(&self, term: u64) {
        self.primary_term.store(term, Ordering::SeqCst);
    }

    pub fn term(&self) -> u64 {
        self.primary_term.load(Ordering::SeqCst)
    }

    pub fn set_min_required(&self, generation: u64) {
        self.min_required.store(generation, Ordering::SeqCst);
    }

    pub fn reset_called(&self) -> bool {
        self.reset_called.load(Ordering::SeqCst)
    }

    /// Appends an operation to the active writer.
    pub fn append(&self, op: &str) {
        let current = self.current.lock().unwrap();
        let inner = current.as_ref().expect("no active writer");
        let mut inner = inner.lock().unwrap();
        inner.ops.push(op.to_string());
        inner.dirty = true;
    }

    fn new_writer(&self, generation: u64, primary_term: u64) -> Box<dyn WalWriter> {
        let inner = Arc::new(Mutex::new(WriterInner {
            dir: self.dir.clone(),
            generation,
            primary_term,
            ops: Vec::new(),
            dirty: false,
        }));
        *self.current.lock().unwrap() = Some(Arc::clone(&inner));
        Box::new(MockWriter { inner })
    }
}

impl WalWriter for MockWriter {
    fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }

    fn primary_term(&self) -> u64 {
        self.inner.lock().unwrap().primary_term
    }

    fn num_ops(&self) -> u64 {
        self.inner.lock().unwrap().ops.len() as u64
    }

    fn sync(&mut self) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let was_dirty = inner.dirty;
        inner.dirty = false;
        Ok(was_dirty)
    }

    fn sync_needed(&self) -> bool {
        self.inner.lock().unwrap().dirty
    }

    fn seal(self: Box<Self>) -> Result<SealedSegment> {
        let inner = self.inner.lock().unwrap();
        let min_generation =
            scan_min_generation(&inner.dir).unwrap_or(inner.generation).min(inner.generation);
        let (min_seq_no, max_seq_no) = if inner.ops.is_empty() {
            (NO_OPS_PERFORMED, NO_OPS_PERFORMED)
        } else {
            (0, inner.ops.len() as i64 - 1)
        };
        let checkpoint = Checkpoint {
            generation: inner.generation,
            min_generation,
            min_seq_no,
            max_seq_no,
            num_ops: inner.ops.len() as u64,
            global_checkpoint: max_seq_no,
        };
        write_segment(&inner.dir, &checkpoint, inner.primary_term, &inner.ops)
    }
}

/// Writes the data, checkpoint and current-checkpoint files for one sealed
/// generation and returns its descriptor.
fn write_segment(
    dir: &Path,
    checkpoint: &Checkpoint,
    primary_term: u64,
    ops: &[String],
) -> Result<SealedSegment> {
    let data = serde_json::to_vec(ops)
        .map_err(|e| Error::Decode { path: "segment".to_string(), reason: e.to_string() })?;
    let ckp = serde_json::to_vec(checkpoint)
        .map_err(|e| Error::Decode { path: "checkpoint".to_string(), reason: e.to_string() })?;

    let data_path = dir.join(types::segment_file_name(checkpoint.generation));
    let checkpoint_path = dir.join(types::checkpoint_file_name(checkpoint.generation));
    std::fs::write(&data_path, &data)?;
    std::fs::write(&checkpoint_path, &ckp)?;
    std::fs::write(dir.join(CURRENT_CHECKPOINT_FILE), &ckp)?;

    Ok(SealedSegment {
        generation: checkpoint.generation,
        primary_term,
        checkpoint: *checkpoint,
        data_checksum: crc32c::crc32c(&data),
        data_path,
        checkpoint_checksum: crc32c::crc32c(&ckp),
        checkpoint_path,
    })
}

fn scan_min_generation(dir: &Path) -> Option<u64> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.ends_with(types::CHECKPOINT_SUFFIX))
        .filter_map(|name| types::parse_generation(&name))
        .min()
}

impl WalFactory for MockWalFactory {
    fn create_writer(&self, generation: u64, primary_term: u64) -> Result<Box<dyn WalWriter>> {
        Ok(self.new_writer(generation, primary_term))
    }

    fn open_local(&self, location: &Path) -> Result<(Vec<SealedSegment>, Box<dyn WalWriter>)> {
        std::fs::create_dir_all(location)?;
        let term = self.term();

        let mut readers = Vec::new();
        for entry in std::fs::read_dir(location)?.flatten() {
            let Ok(name) = entry.file_name().into_string() else { continue };
            if !name.ends_with(types::CHECKPOINT_SUFFIX) {
                continue;
            }
            let Some(generation) = types::parse_generation(&name) else { continue };
            let ckp_bytes = std::fs::read(entry.path())?;
            let checkpoint: Checkpoint = serde_json::from_slice(&ckp_bytes)
                .map_err(|e| Error::Decode { path: name.clone(), reason: e.to_string() })?;
            let data_path = location.join(types::segment_file_name(generation));
            let data = std::fs::read(&data_path)?;
            readers.push(SealedSegment {
                generation,
                primary_term: term,
                checkpoint,
                data_checksum: crc32c::crc32c(&data),
                data_path,
                checkpoint_checksum: crc32c::crc32c(&ckp_bytes),
                checkpoint_path: entry.path(),
            });
        }
        readers.sort_by_key(|r| r.generation);

        if readers.is_empty() {
            let checkpoint = Checkpoint::empty(1, -1);
            readers.push(write_segment(location, &checkpoint, term, &[])?);
        }
        let next = readers.last().map(|r| r.generation).unwrap_or(0) + 1;
        Ok((readers, self.new_writer(next, term)))
    }

    fn create_empty(&self, location: &Path, prior: &Checkpoint) -> Result<()> {
        self.reset_called.store(true, Ordering::SeqCst);
        for entry in std::fs::read_dir(location)?.flatten() {
            let Ok(name) = entry.file_name().into_string() else { continue };
            if name == CURRENT_CHECKPOINT_FILE || types::parse_generation(&name).is_some() {
                std::fs::remove_file(entry.path())?;
            }
        }
        let checkpoint = Checkpoint::empty(prior.generation + 1, prior.global_checkpoint);
        write_segment(location, &checkpoint, self.term(), &[])?;
        Ok(())
    }

    fn read_checkpoint(&self, location: &Path) -> Result<Option<Checkpoint>> {
        let path = location.join(CURRENT_CHECKPOINT_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let checkpoint = serde_json::from_slice(&bytes).map_err(|e| Error::Decode {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(checkpoint))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn min_generation_required(&self, _readers: &[SealedSegment], writer_generation: u64) -> u64 {
        match self.min_required.load(Ordering::SeqCst) {
            0 => writer_generation,
            v => v.min(writer_generation),
        }
    }
}

/// Blob store wrapper that fails the next `n` puts with a remote error.
pub struct FlakyStore {
    inner: Arc<InMemoryBlobStore>,
    failing_puts: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryBlobStore>) -> Arc<Self> {
        Arc::new(Self { inner, failing_puts: AtomicU32::new(0) })
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self, path: &str) -> Result<()> {
        if self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Remote {
                path: path.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.maybe_fail(path)?;
        self.inner.put(path, data).await
    }

    async fn put_with_metadata(
        &self,
        path: &str,
        data: Bytes,
        metadata: BlobMetadata,
    ) -> Result<()> {
        self.maybe_fail(path)?;
        self.inner.put_with_metadata(path, data, metadata).await
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.inner.get(path).await
    }

    async fn get_with_metadata(&self, path: &str) -> Result<(Bytes, BlobMetadata)> {
        self.inner.get_with_metadata(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, paths: &[String]) -> Result<()> {
        self.inner.delete(paths).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.inner.delete_prefix(prefix).await
    }

    fn supports_blob_metadata(&self) -> bool {
        self.inner.supports_blob_metadata()
    }
}

/// Blob store wrapper that can hold puts at a gate, keeping an upload in
/// flight for as long as a test needs.
pub struct SlowStore {
    inner: Arc<InMemoryBlobStore>,
    gate: tokio::sync::Semaphore,
    blocking: AtomicBool,
    waiting: AtomicU32,
}

impl SlowStore {
    pub fn new(inner: Arc<InMemoryBlobStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: tokio::sync::Semaphore::new(0),
            blocking: AtomicBool::new(false),
            waiting: AtomicU32::new(0),
        })
    }

    pub fn block_puts(&self) {
        self.blocking.store(true, Ordering::SeqCst);
    }

    pub fn release_puts(&self) {
        self.blocking.store(false, Ordering::SeqCst);
        self.gate.add_permits(1024);
    }

    /// Number of puts currently parked at the gate.
    pub fn puts_in_flight(&self) -> u32 {
        self.waiting.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        if self.blocking.load(Ordering::SeqCst) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.expect("gate closed").forget();
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BlobStore for SlowStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.pause().await;
        self.inner.put(path, data).await
    }

    async fn put_with_metadata(
        &self,
        path: &str,
        data: Bytes,
        metadata: BlobMetadata,
    ) -> Result<()> {
        self.pause().await;
        self.inner.put_with_metadata(path, data, metadata).await
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.inner.get(path).await
    }

    async fn get_with_metadata(&self, path: &str) -> Result<(Bytes, BlobMetadata)> {
        self.inner.get_with_metadata(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, paths: &[String]) -> Result<()> {
        self.inner.delete(paths).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.inner.delete_prefix(prefix).await
    }

    fn supports_blob_metadata(&self) -> bool {
        self.inner.supports_blob_metadata()
    }
}

/// Blob store wrapper that reports the configured paths missing exactly once,
/// simulating a concurrent relocation deleting blobs mid-download.
pub struct VanishingStore {
    inner: Arc<InMemoryBlobStore>,
    vanish_once: Mutex<HashSet<String>>,
}

impl VanishingStore {
    pub fn new(inner: Arc<InMemoryBlobStore>) -> Arc<Self> {
        Arc::new(Self { inner, vanish_once: Mutex::new(HashSet::new()) })
    }

    pub fn vanish_once(&self, path: &str) {
        self.vanish_once.lock().unwrap().insert(path.to_string());
    }

    fn check(&self, path: &str) -> Result<()> {
        if self.vanish_once.lock().unwrap().remove(path) {
            return Err(Error::BlobNotFound { path: path.to_string() });
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for VanishingStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.inner.put(path, data).await
    }

    async fn put_with_metadata(
        &self,
        path: &str,
        data: Bytes,
        metadata: BlobMetadata,
    ) -> Result<()> {
        self.inner.put_with_metadata(path, data, metadata).await
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.check(path)?;
        self.inner.get(path).await
    }

    async fn get_with_metadata(&self, path: &str) -> Result<(Bytes, BlobMetadata)> {
        self.check(path)?;
        self.inner.get_with_metadata(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        self.inner.list(prefix).await
    }

    async fn delete(&self, paths: &[String]) -> Result<()> {
        self.inner.delete(paths).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.inner.delete_prefix(prefix).await
    }

    fn supports_blob_metadata(&self) -> bool {
        self.inner.supports_blob_metadata()
    }
}

/// Opens a [`RemoteWal`] wired to the mock WAL, with the primary term read
/// from the factory.
pub async fn open_wal(
    store: Arc<dyn BlobStore>,
    factory: &Arc<MockWalFactory>,
    dir: &Path,
    seed_remote: bool,
    config: RemoteWalConfig,
    pins: Arc<dyn PinnedTimestampProvider>,
    started: Arc<AtomicBool>,
) -> Result<RemoteWal> {
    let term_source = Arc::clone(factory);
    let options = RemoteWalOptions {
        shard: ShardId::new("idx", 0),
        config,
        base_path: "cluster".to_string(),
        location: dir.to_path_buf(),
        seed_remote,
    };
    RemoteWal::open(
        options,
        store,
        Arc::clone(factory) as Arc<dyn WalFactory>,
        pins,
        move || term_source.term(),
        move || started.load(Ordering::SeqCst),
    )
    .await
}

/// A config with a stable node id and no extra retention margin.
pub fn test_config() -> RemoteWalConfig {
    RemoteWalConfig {
        node_id: "node-1".to_string(),
        extra_keep_generations: 0,
        ..RemoteWalConfig::default()
    }
}

/// A pin provider with no pins and a refresh time far in the future, so the
/// staleness guard and the age filter never get in the way.
pub fn fresh_pins() -> Arc<dyn PinnedTimestampProvider> {
    Arc::new(|| PinnedTimestamps::new(now_millis() + 3_600_000, []))
}

/// A pin provider reading a shared, mutable snapshot.
pub fn shared_pins(state: &Arc<Mutex<PinnedTimestamps>>) -> Arc<dyn PinnedTimestampProvider> {
    let state = Arc::clone(state);
    Arc::new(move || state.lock().unwrap().clone())
}

/// Metadata object names currently in `store`, newest first.
pub fn metadata_names(store: &InMemoryBlobStore) -> Vec<String> {
    store
        .paths()
        .into_iter()
        .filter_map(|p| p.split("/metadata/").nth(1).map(str::to_string))
        .collect()
}

/// Polls `cond` until it holds, panicking after two seconds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Current wall clock in epoch millis.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
