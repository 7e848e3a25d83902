// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for the remote-mirrored WAL.
//!
//! Contention on the sync permit is deliberately *not* an error: a caller
//! that loses the race to upload gets a "skipped" outcome and retries on its
//! own schedule. Everything that is an error is surfaced, never swallowed.

use thiserror::Error;

/// A specialized `Result` type for Tidelog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the sync, transfer and retention paths.
#[derive(Debug, Error)]
pub enum Error {
    /// Local filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transient remote-store failure (upload, download, list or delete).
    #[error("remote store error on {path}: {reason}")]
    Remote {
        /// Blob path the operation was addressing.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// The requested blob does not exist in the remote store.
    ///
    /// During replica recovery this is retried: a concurrent primary
    /// relocation may delete a generation out from under the download.
    #[error("blob not found: {path}")]
    BlobNotFound {
        /// Blob path that was requested.
        path: String,
    },

    /// Checksum mismatch detected while verifying a file for upload.
    ///
    /// Fatal for the upload attempt; never retried automatically.
    #[error("corruption detected in {file}: expected checksum {expected:#010x}, got {actual:#010x}")]
    Corruption {
        /// File that failed verification.
        file: String,
        /// Checksum recorded when the segment was sealed.
        expected: u32,
        /// Checksum of the bytes about to be uploaded.
        actual: u32,
    },

    /// A build-time invariant of the snapshot or metadata was violated.
    ///
    /// Indicates WAL corruption upstream; aborts the operation.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Draining could not acquire all sync permits within the bound.
    ///
    /// Fatal to the requesting operation (e.g. aborts a relocation).
    #[error("timed out after {timeout_ms}ms while draining in-flight syncs")]
    DrainTimeout {
        /// The timeout that elapsed, in milliseconds.
        timeout_ms: u64,
    },

    /// The WAL has been closed.
    #[error("WAL is closed")]
    Closed,

    /// A remote object could not be decoded.
    #[error("failed to decode {path}: {reason}")]
    Decode {
        /// Blob path of the undecodable object.
        path: String,
        /// What went wrong.
        reason: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True if the error means a remote blob was missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::BlobNotFound { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
