// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration for the remote-mirrored WAL.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for one shard's remote WAL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteWalConfig {
    /// Identifier of the node this shard is hosted on. Encoded into the
    /// remote metadata object names.
    pub node_id: String,

    /// Number of extra generations to keep remotely beyond what the local
    /// deletion policy requires. A safety margin for in-flight readers.
    pub extra_keep_generations: u64,

    /// Number of uploaded-but-unflushed local generations above which
    /// `should_flush` reports true. `None` disables the check.
    pub max_uploaded_readers: Option<usize>,

    /// Age above which the pinned-timestamp snapshot is considered stale.
    /// Retention refuses to delete anything under a stale view of pins.
    pub pinned_timestamp_staleness_ms: u64,

    /// Bound on how long draining waits for in-flight syncs to finish.
    pub drain_timeout_ms: u64,

    /// Number of times a download interrupted by a missing blob is restarted
    /// before the error is surfaced.
    pub download_retries: u32,
}

impl Default for RemoteWalConfig {
    fn default() -> Self {
        Self {
            node_id: "unknown".to_string(),
            extra_keep_generations: 100,
            max_uploaded_readers: Some(1000),
            pinned_timestamp_staleness_ms: 8 * 60 * 1000,
            drain_timeout_ms: 60 * 1000,
            download_retries: 2,
        }
    }
}

impl RemoteWalConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// The drain timeout as a [`Duration`].
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// The pinned-timestamp staleness bound as a [`Duration`].
    #[must_use]
    pub fn pinned_timestamp_staleness(&self) -> Duration {
        Duration::from_millis(self.pinned_timestamp_staleness_ms)
    }
}
