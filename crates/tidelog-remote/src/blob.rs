// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Blob store seam.
//!
//! The remote store is an external collaborator; this module defines the
//! narrow interface the mirroring engine needs plus an in-memory
//! implementation used by tests and embedders.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tidelog_core::{Error, Result};

/// One entry returned by a prefix listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    /// Full path of the blob.
    pub path: String,
    /// Size of the blob in bytes.
    pub size: u64,
}

/// Arbitrary string key/value pairs attached to a blob.
pub type BlobMetadata = HashMap<String, String>;

/// Interface to the remote blob store.
///
/// Implementations must be safe for concurrent multi-request use; the engine
/// issues uploads, downloads and deletes from different tasks.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob at `path`.
    async fn put(&self, path: &str, data: Bytes) -> Result<()>;

    /// Store a blob at `path` with attached metadata.
    ///
    /// Only called when [`BlobStore::supports_blob_metadata`] is true.
    async fn put_with_metadata(&self, path: &str, data: Bytes, metadata: BlobMetadata)
        -> Result<()>;

    /// Retrieve a blob.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Retrieve a blob together with its attached metadata.
    async fn get_with_metadata(&self, path: &str) -> Result<(Bytes, BlobMetadata)>;

    /// List all blobs under `prefix`, sorted lexicographically by path.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>>;

    /// Delete the given blobs. Missing paths are not an error.
    async fn delete(&self, paths: &[String]) -> Result<()>;

    /// Delete every blob under `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// True if the store can attach metadata to a blob in the same request.
    ///
    /// Decides once, at construction time, whether checkpoints ride along as
    /// blob metadata or are uploaded as separate objects.
    fn supports_blob_metadata(&self) -> bool {
        false
    }
}

/// In-memory [`BlobStore`] backed by a concurrent map.
///
/// Supports blob metadata. Used by tests and by embedders that want a
/// process-local remote store.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: DashMap<String, (Bytes, BlobMetadata)>,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// True if the store holds no blobs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Returns all stored paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.blobs.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Removes a single blob directly, bypassing the trait surface.
    ///
    /// Lets tests simulate a concurrent relocation deleting a generation
    /// while a replica is downloading it.
    pub fn remove(&self, path: &str) -> bool {
        self.blobs.remove(path).is_some()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, path: &str, data: Bytes) -> Result<()> {
        self.blobs.insert(path.to_string(), (data, BlobMetadata::new()));
        Ok(())
    }

    async fn put_with_metadata(
        &self,
        path: &str,
        data: Bytes,
        metadata: BlobMetadata,
    ) -> Result<()> {
        self.blobs.insert(path.to_string(), (data, metadata));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.blobs
            .get(path)
            .map(|e| e.value().0.clone())
            .ok_or_else(|| Error::BlobNotFound { path: path.to_string() })
    }

    async fn get_with_metadata(&self, path: &str) -> Result<(Bytes, BlobMetadata)> {
        self.blobs
            .get(path)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::BlobNotFound { path: path.to_string() })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let mut entries: Vec<BlobEntry> = self
            .blobs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| BlobEntry { path: e.key().clone(), size: e.value().0.len() as u64 })
            .collect();
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn delete(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            self.blobs.remove(path);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.blobs.retain(|path, _| !path.starts_with(prefix));
        Ok(())
    }

    fn supports_blob_metadata(&self) -> bool {
        true
    }
}
