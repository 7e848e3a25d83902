// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Core types and utilities shared across Tidelog components.
//!
//! This crate provides the fundamental building blocks of the remote-mirrored
//! write-ahead log:
//! - Domain types (generations, checkpoints, shard identity)
//! - Configuration management
//! - The error taxonomy used by the sync, transfer and retention paths
//! - The read-only pinned-timestamp snapshot consumed by retention

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod pinned;
pub mod types;

pub use config::RemoteWalConfig;
pub use error::{Error, Result};
pub use pinned::{PinnedTimestampProvider, PinnedTimestamps};
pub use types::{Checkpoint, ShardId, NO_OPS_PERFORMED};
