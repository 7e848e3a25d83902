// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Remote path layout for one shard.
//!
//! Per shard there are two logical prefixes: data objects named by generation
//! under their primary term, and metadata objects whose names sort
//! newest-first (see [`crate::metadata`]).

use tidelog_core::ShardId;

/// Computes the blob paths for one shard's remote WAL.
#[derive(Debug, Clone)]
pub struct RemoteLayout {
    data_prefix: String,
    metadata_prefix: String,
}

impl RemoteLayout {
    /// Creates the layout rooted at `base` for `shard`.
    #[must_use]
    pub fn new(base: &str, shard: &ShardId) -> Self {
        let root = if base.is_empty() {
            format!("{}/{}/wal", shard.index_uid, shard.shard)
        } else {
            format!("{}/{}/{}/wal", base.trim_end_matches('/'), shard.index_uid, shard.shard)
        };
        Self { data_prefix: format!("{root}/data/"), metadata_prefix: format!("{root}/metadata/") }
    }

    /// Prefix under which all data objects live.
    #[must_use]
    pub fn data_prefix(&self) -> &str {
        &self.data_prefix
    }

    /// Prefix under which all metadata objects live.
    #[must_use]
    pub fn metadata_prefix(&self) -> &str {
        &self.metadata_prefix
    }

    /// Prefix holding every data object of one primary term.
    #[must_use]
    pub fn primary_term_prefix(&self, primary_term: u64) -> String {
        format!("{}{primary_term}/", self.data_prefix)
    }

    /// Path of one data object.
    #[must_use]
    pub fn data_path(&self, primary_term: u64, file_name: &str) -> String {
        format!("{}{primary_term}/{file_name}", self.data_prefix)
    }

    /// Path of one metadata object.
    #[must_use]
    pub fn metadata_path(&self, file_name: &str) -> String {
        format!("{}{file_name}", self.metadata_prefix)
    }

    /// Extracts the primary term from a data object path, if it has one.
    #[must_use]
    pub fn parse_primary_term(&self, path: &str) -> Option<u64> {
        let rest = path.strip_prefix(self.data_prefix.as_str())?;
        rest.split('/').next()?.parse().ok()
    }
}
