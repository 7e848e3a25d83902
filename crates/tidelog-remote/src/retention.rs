// Copyright 2026 The Tidelog Authors
// SPDX-License-Identifier: Apache-2.0

//! Retention sweep over the remote store.
//!
//! A sweep decides which metadata objects and generations are safe to delete
//! and hands the deletes to background tasks. Safety rules, in order:
//!
//! - nothing is deleted under a stale view of the pinned timestamps
//! - the newest metadata object always survives while the index exists
//! - every pinned timestamp implicitly locks the newest metadata object
//!   created at or before it, and every generation referenced by a surviving
//!   metadata object survives too
//! - generations at or above the minimum still referenced locally (minus a
//!   configurable safety margin) survive
//!
//! At most one generation delete and one metadata delete are in flight at a
//! time, enforced by a two-permit gate. A sweep that cannot take both permits
//! reports itself skipped rather than queueing up.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tidelog_core::{PinnedTimestampProvider, PinnedTimestamps, RemoteWalConfig, Result, ShardId};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::metadata;
use crate::transfer::TransferManager;

/// Number of concurrent remote-delete slots.
const DELETION_PERMITS: u32 = 2;

/// Inputs a sweep needs from the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct SweepContext {
    /// True if the owning index was deleted. Drops the keep-newest rule and
    /// the staleness guard, since no new uploads can arrive.
    pub index_deleted: bool,
    /// Minimum generation the local WAL still references.
    pub min_referenced_generation: u64,
    /// Primary term the deleted generations were last uploaded under.
    pub primary_term: u64,
}

/// Why a sweep did not schedule any deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The pinned-timestamp snapshot is too old to trust.
    StalePinnedTimestamps,
    /// A previous sweep's deletes are still in flight.
    DeletesInFlight,
    /// One or zero metadata objects exist remotely.
    NothingEligible,
    /// The shard is not an active primary, is paused for relocation, or is
    /// closed.
    NotActive,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The sweep bailed out without scheduling anything.
    Skipped(SkipReason),
    /// Deletes were handed to background tasks.
    Scheduled {
        /// Number of generations scheduled for deletion.
        generations: usize,
        /// Number of metadata objects scheduled for deletion.
        metadata_files: usize,
    },
}

/// Plans and schedules remote retention for one shard.
pub struct RetentionPlanner {
    shard: ShardId,
    transfer: Arc<TransferManager>,
    pins: Arc<dyn PinnedTimestampProvider>,
    config: RemoteWalConfig,
    permits: Arc<Semaphore>,
    // pin timestamp -> identity of the metadata object it locks
    pin_matches: Mutex<HashMap<u64, String>>,
    // old-format metadata name -> generation range read from its body
    range_cache: Mutex<HashMap<String, (u64, u64)>>,
    older_terms_cleaned: AtomicBool,
}

impl RetentionPlanner {
    /// Creates a planner for `shard`.
    #[must_use]
    pub fn new(
        shard: ShardId,
        transfer: Arc<TransferManager>,
        pins: Arc<dyn PinnedTimestampProvider>,
        config: RemoteWalConfig,
    ) -> Self {
        Self {
            shard,
            transfer,
            pins,
            config,
            permits: Arc::new(Semaphore::new(DELETION_PERMITS as usize)),
            pin_matches: Mutex::new(HashMap::new()),
            range_cache: Mutex::new(HashMap::new()),
            older_terms_cleaned: AtomicBool::new(false),
        }
    }

    /// Runs one sweep. Returns what was scheduled, or why nothing was.
    ///
    /// Deletes run on background tasks after this returns; a follow-up sweep
    /// is skipped until they complete.
    pub async fn sweep(&self, ctx: SweepContext) -> Result<SweepOutcome> {
        let pins = self.pins.current();
        let now = chrono::Utc::now().timestamp_millis() as u64;
        // Double the configured bound: one missed refresh interval is
        // tolerated before deletes stop.
        if !ctx.index_deleted && pins.is_stale(now, 2 * self.config.pinned_timestamp_staleness()) {
            warn!(
                shard = %self.shard,
                refreshed_at = pins.refreshed_at_millis,
                "pinned timestamps are stale, skipping retention sweep"
            );
            return Ok(SweepOutcome::Skipped(SkipReason::StalePinnedTimestamps));
        }

        let Ok(acquired) =
            Arc::clone(&self.permits).try_acquire_many_owned(DELETION_PERMITS)
        else {
            debug!(shard = %self.shard, "deletes still in flight, skipping retention sweep");
            return Ok(SweepOutcome::Skipped(SkipReason::DeletesInFlight));
        };

        let all_files = self.transfer.list_metadata_files().await?;
        if all_files.len() <= 1 {
            return Ok(SweepOutcome::Skipped(SkipReason::NothingEligible));
        }

        let locked = self.locked_identities(&all_files, &pins)?;

        // Newest first; the newest object survives while the index exists,
        // and nothing newer than the pin snapshot is judged against it.
        let keep_newest = usize::from(!ctx.index_deleted);
        let mut deletable: Vec<String> = Vec::new();
        for name in all_files.iter().skip(keep_newest) {
            if metadata::parse_timestamp(name)? > pins.refreshed_at_millis {
                continue;
            }
            if locked.contains(&metadata::parse_identity(name)?) {
                continue;
            }
            deletable.push(name.clone());
        }

        // A concurrent refresh may have replaced the registry while the
        // listing ran; re-read it and stop if the view went stale.
        if !ctx.index_deleted {
            let pins = self.pins.current();
            let now = chrono::Utc::now().timestamp_millis() as u64;
            if pins.is_stale(now, 2 * self.config.pinned_timestamp_staleness()) {
                warn!(
                    shard = %self.shard,
                    refreshed_at = pins.refreshed_at_millis,
                    "pinned timestamps went stale mid-sweep, aborting"
                );
                drop(acquired);
                return Ok(SweepOutcome::Skipped(SkipReason::StalePinnedTimestamps));
            }
        }

        let max_deletable =
            ctx.min_referenced_generation.saturating_sub(1 + self.config.extra_keep_generations);

        // A metadata object whose range reaches past the deletable bound is
        // still live and must survive this sweep.
        let mut files_to_delete: Vec<String> = Vec::new();
        let mut candidate_generations: BTreeSet<u64> = BTreeSet::new();
        for name in deletable {
            let (min, max) = self.resolve_range(&name).await?;
            if max > max_deletable {
                continue;
            }
            candidate_generations.extend(min..=max);
            files_to_delete.push(name);
        }

        let surviving: Vec<&String> =
            all_files.iter().filter(|name| !files_to_delete.contains(*name)).collect();
        let mut surviving_ranges: BTreeSet<(u64, u64)> = BTreeSet::new();
        for name in &surviving {
            surviving_ranges.insert(self.resolve_range(name).await?);
        }
        self.prune_range_cache(&surviving);

        let generations: Vec<u64> = candidate_generations
            .into_iter()
            .filter(|g| *g <= max_deletable && !is_generation_pinned(*g, &surviving_ranges))
            .collect();

        if generations.is_empty() && files_to_delete.is_empty() {
            drop(acquired);
            return Ok(SweepOutcome::Skipped(SkipReason::NothingEligible));
        }

        info!(
            shard = %self.shard,
            generations = generations.len(),
            metadata_files = files_to_delete.len(),
            max_deletable,
            "scheduling retention deletes"
        );

        // Hand both permit slots to the background tasks. Generations go
        // first; their metadata objects follow once the data is gone, so a
        // surviving metadata object never references deleted generations.
        acquired.forget();
        let outcome = SweepOutcome::Scheduled {
            generations: generations.len(),
            metadata_files: files_to_delete.len(),
        };
        let generation_slot = Arc::clone(&self.permits);
        let metadata_slot = Arc::clone(&self.permits);
        let transfer = Arc::clone(&self.transfer);
        let schedule_metadata = move || {
            if files_to_delete.is_empty() {
                metadata_slot.add_permits(1);
            } else {
                transfer.delete_metadata_files_async(files_to_delete, move || {
                    metadata_slot.add_permits(1);
                });
            }
        };
        if generations.is_empty() {
            generation_slot.add_permits(1);
            schedule_metadata();
        } else {
            self.transfer.delete_generations_async(ctx.primary_term, generations, move || {
                generation_slot.add_permits(1);
                schedule_metadata();
            });
        }

        self.cleanup_older_primary_terms(&surviving).await;
        Ok(outcome)
    }

    /// Identities of the metadata objects implicitly locked by pins.
    ///
    /// Each pin locks the newest object created at or before it. Matches are
    /// cached per pin and reused as long as the matched object still exists,
    /// so the match is stable across sweeps even as newer objects appear.
    fn locked_identities(
        &self,
        files: &[String],
        pins: &PinnedTimestamps,
    ) -> Result<HashSet<String>> {
        let mut identities = HashSet::with_capacity(files.len());
        for name in files {
            identities.insert(metadata::parse_identity(name)?);
        }

        let mut cache = self.pin_matches.lock().expect("pin match cache poisoned");
        cache.retain(|pin, _| pins.timestamps.contains(pin));

        let mut locked = HashSet::new();
        for &pin in &pins.timestamps {
            if let Some(identity) = cache.get(&pin).cloned() {
                if identities.contains(&identity) {
                    locked.insert(identity);
                    continue;
                }
                cache.remove(&pin);
            }
            for name in files {
                if metadata::parse_timestamp(name)? <= pin {
                    let identity = metadata::parse_identity(name)?;
                    cache.insert(pin, identity.clone());
                    locked.insert(identity);
                    break;
                }
            }
        }
        Ok(locked)
    }

    /// `(min, max)` generation range of a metadata object, from its name or,
    /// for old-format names, from its body (cached after the first read).
    async fn resolve_range(&self, name: &str) -> Result<(u64, u64)> {
        if let Some(range) = metadata::parse_generation_range(name)? {
            return Ok(range);
        }
        {
            let cache = self.range_cache.lock().expect("range cache poisoned");
            if let Some(range) = cache.get(name).copied() {
                return Ok(range);
            }
        }
        let md = self.transfer.read_metadata_file(name).await?;
        let range = (md.min_generation, md.generation);
        self.range_cache.lock().expect("range cache poisoned").insert(name.to_string(), range);
        Ok(range)
    }

    fn prune_range_cache(&self, surviving: &[&String]) {
        let keep: HashSet<&str> = surviving.iter().map(|s| s.as_str()).collect();
        self.range_cache
            .lock()
            .expect("range cache poisoned")
            .retain(|name, _| keep.contains(name.as_str()));
    }

    /// Deletes data stored under primary terms older than anything the
    /// surviving metadata objects reference. Runs at most once per instance,
    /// on the first sweep that schedules deletes; later sweeps find nothing
    /// new because terms only grow.
    async fn cleanup_older_primary_terms(&self, surviving: &[&String]) {
        if self
            .older_terms_cleaned
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // The oldest surviving object references the oldest generations, so
        // its term map bounds the oldest term still needed.
        let Some(oldest) = surviving.last() else { return };
        let md = match self.transfer.read_metadata_file(oldest).await {
            Ok(md) => md,
            Err(e) => {
                warn!(shard = %self.shard, error = %e, "skipping primary term cleanup");
                return;
            }
        };
        let minimum_term = md
            .generation_to_primary_term
            .values()
            .copied()
            .chain(std::iter::once(md.primary_term))
            .min()
            .unwrap_or(md.primary_term);
        self.transfer.delete_primary_terms_async(minimum_term);
    }
}

impl std::fmt::Debug for RetentionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetentionPlanner").field("shard", &self.shard).finish_non_exhaustive()
    }
}

/// True if `generation` falls inside any surviving metadata object's range.
fn is_generation_pinned(generation: u64, ranges: &BTreeSet<(u64, u64)>) -> bool {
    if let Some(&(min, max)) = ranges.range(..=(generation, u64::MAX)).next_back() {
        if generation >= min && generation <= max {
            return true;
        }
    }
    if let Some(&(min, max)) = ranges.range((generation, 0)..).next() {
        if generation >= min && generation <= max {
            return true;
        }
    }
    false
}
