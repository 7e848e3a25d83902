// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Remote metadata objects and their name encoding.
//!
//! Every successful sync uploads one metadata object describing the upload.
//! Object names embed inverted integers (`u64::MAX - value`, zero padded) so
//! that a plain lexicographic listing yields newest-first order without any
//! server-side sorting.
//!
//! Two name formats coexist. The current format encodes the minimum
//! generation in the name, so retention can resolve a file's generation range
//! without fetching it. Older files lack that field; their range has to be
//! discovered by reading the object body once (and is then cached, see
//! [`crate::retention`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tidelog_core::{Error, Result};

/// Separator between fields of a metadata object name.
pub const METADATA_SEPARATOR: &str = "__";

/// Name prefix of every metadata object.
const METADATA_NAME_PREFIX: &str = "metadata";

/// Codec version written by this engine (min generation in the name).
const CODEC_RANGE_IN_NAME: u32 = 2;

/// Legacy codec version (generation range only in the body).
const CODEC_PLAIN: u32 = 1;

/// Inverts a value so that larger inputs sort lexicographically first.
#[must_use]
pub fn invert_u64(value: u64) -> String {
    format!("{:020}", u64::MAX - value)
}

/// Reverses [`invert_u64`].
pub fn uninvert_u64(encoded: &str) -> Result<u64> {
    let inverted: u64 = encoded
        .parse()
        .map_err(|_| Error::Decode { path: encoded.to_string(), reason: "not an inverted u64".to_string() })?;
    Ok(u64::MAX - inverted)
}

/// The remote object describing one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    /// Primary term of the upload.
    pub primary_term: u64,
    /// Highest generation contained in the upload.
    pub generation: u64,
    /// Minimum generation still referenced by the highest generation's
    /// checkpoint at upload time.
    pub min_generation: u64,
    /// Number of generations described by this object.
    pub file_count: usize,
    /// Node that performed the upload.
    pub node_id: String,
    /// Wall-clock creation time in epoch millis.
    pub created_at_millis: u64,
    /// Maps every generation in `[min_generation, generation]` to the
    /// primary term its data object lives under. Download uses this to
    /// address generations uploaded under earlier terms.
    pub generation_to_primary_term: BTreeMap<u64, u64>,
}

impl TransferMetadata {
    /// The remote object name for this metadata, current format.
    #[must_use]
    pub fn file_name(&self) -> String {
        [
            METADATA_NAME_PREFIX.to_string(),
            invert_u64(self.primary_term),
            invert_u64(self.generation),
            invert_u64(self.created_at_millis),
            self.node_id.clone(),
            invert_u64(self.min_generation),
            CODEC_RANGE_IN_NAME.to_string(),
        ]
        .join(METADATA_SEPARATOR)
    }

    /// Serializes the object body.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| Error::Decode { path: self.file_name(), reason: e.to_string() })
    }

    /// Deserializes an object body read from `path`.
    pub fn from_bytes(path: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::Decode { path: path.to_string(), reason: e.to_string() })
    }
}

/// Field positions within a metadata object name.
mod field {
    pub const PRIMARY_TERM: usize = 1;
    pub const GENERATION: usize = 2;
    pub const TIMESTAMP: usize = 3;
    pub const NODE_ID: usize = 4;
    pub const MIN_GENERATION: usize = 5;

    /// prefix, term, generation, timestamp, node, codec
    pub const OLD_FORMAT_FIELDS: usize = 6;
    /// prefix, term, generation, timestamp, node, min generation, codec
    pub const NEW_FORMAT_FIELDS: usize = 7;
}

fn fields(file_name: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = file_name.split(METADATA_SEPARATOR).collect();
    if (parts.len() == field::OLD_FORMAT_FIELDS || parts.len() == field::NEW_FORMAT_FIELDS)
        && parts[0] == METADATA_NAME_PREFIX
    {
        Ok(parts)
    } else {
        Err(Error::Decode {
            path: file_name.to_string(),
            reason: "unrecognized metadata file name".to_string(),
        })
    }
}

/// Primary term encoded in a metadata file name.
pub fn parse_primary_term(file_name: &str) -> Result<u64> {
    uninvert_u64(fields(file_name)?[field::PRIMARY_TERM])
}

/// Creation timestamp (epoch millis) encoded in a metadata file name.
pub fn parse_timestamp(file_name: &str) -> Result<u64> {
    uninvert_u64(fields(file_name)?[field::TIMESTAMP])
}

/// `(min, max)` generation range encoded in a metadata file name.
///
/// Returns `None` for old-format names, whose range can only be discovered
/// by reading the object body.
pub fn parse_generation_range(file_name: &str) -> Result<Option<(u64, u64)>> {
    let parts = fields(file_name)?;
    if parts.len() != field::NEW_FORMAT_FIELDS {
        return Ok(None);
    }
    let max = uninvert_u64(parts[field::GENERATION])?;
    let min = uninvert_u64(parts[field::MIN_GENERATION])?;
    if min > max {
        return Err(Error::Decode {
            path: file_name.to_string(),
            reason: format!("min generation {min} exceeds max generation {max}"),
        });
    }
    Ok(Some((min, max)))
}

/// `node__term__generation` identity string for a metadata file name.
///
/// Stable across sweeps, used as the cached value when matching metadata
/// files against pinned timestamps.
pub fn parse_identity(file_name: &str) -> Result<String> {
    let parts = fields(file_name)?;
    Ok(format!(
        "{}{}{}{}{}",
        parts[field::NODE_ID],
        METADATA_SEPARATOR,
        uninvert_u64(parts[field::PRIMARY_TERM])?,
        METADATA_SEPARATOR,
        uninvert_u64(parts[field::GENERATION])?
    ))
}

/// Builds an old-format metadata file name. Exists so tests and migration
/// tooling can produce names the retention path must keep understanding.
#[must_use]
pub fn old_format_file_name(
    primary_term: u64,
    generation: u64,
    created_at_millis: u64,
    node_id: &str,
) -> String {
    [
        METADATA_NAME_PREFIX.to_string(),
        invert_u64(primary_term),
        invert_u64(generation),
        invert_u64(created_at_millis),
        node_id.to_string(),
        CODEC_PLAIN.to_string(),
    ]
    .join(METADATA_SEPARATOR)
}
