// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Persistence cycle.
//!
//! Each [`PersistenceCycle::tick`] walks through
//! `Idle -> Collecting -> Fetching -> Reconciling -> Writing -> Idle`:
//!
//! 1. **Collecting**: swap the store's dirty working set out.
//! 2. **Fetching**: per kind, bulk-read the persisted snapshots of the drained identities
//!    that aren't in the session cache.
//! 3. **Reconciling**: combine each snapshot with its drained delta using the kind's merge
//!    schema ([`reconcile`]).
//! 4. **Writing**: bulk-upsert the merged records.
//!
//! A failed read or write hands the affected deltas back to the store, so they are retried
//! on the next tick together with anything merged in the meantime. Retries re-read the
//! snapshot, and the delta only ever holds contributions that haven't been persisted yet,
//! so a retried tick never double-counts.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use itertools::Itertools;
use tally_core::{AggregateRecord, Identity, KindId, MergeError, MergeSchema};
use tally_queue::rate_limited;

use crate::{cache::SessionCache, registry::AggregateKind, store::AggregateStore};

/// Where a tick currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Collecting = 1,
    Fetching = 2,
    Reconciling = 3,
    Writing = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Collecting,
            2 => Phase::Fetching,
            3 => Phase::Reconciling,
            4 => Phase::Writing,
            _ => Phase::Idle,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Combine a persisted snapshot with a drained delta. Pure, so replaying the same inputs
/// gives the same record.
pub fn reconcile(
    schema: &MergeSchema,
    prior: Option<&AggregateRecord>,
    delta: &AggregateRecord,
) -> Result<AggregateRecord, MergeError> {
    match prior {
        Some(prior) => schema.combine(prior, delta),
        None => Ok(delta.clone()),
    }
}

#[derive(Clone, Debug)]
pub struct PersistenceOptions {
    /// Largest number of records passed to one `bulk_upsert`.
    pub max_batch_size: usize,
    /// Cached records unused for this many ticks are evicted.
    pub cache_idle_cycles: u64,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 2_000,
            cache_idle_cycles: 3,
        }
    }
}

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub cycle: u64,
    /// Identities drained from the store, rollups included.
    pub drained: usize,
    /// Snapshots found in storage.
    pub fetched: usize,
    /// Snapshots served from the session cache.
    pub cache_hits: usize,
    /// Records written.
    pub written: usize,
    /// Deltas discarded because their kind is insert-only and the aggregate already exists.
    pub skipped: usize,
    /// Deltas handed back to the store after a storage failure.
    pub restored: usize,
    pub fetch_failures: usize,
    pub write_failures: usize,
    /// Deltas that could not be reconciled with their snapshot and were dropped.
    pub merge_errors: usize,
    /// Session cache entries evicted at the end of the tick.
    pub evicted: usize,
    pub elapsed: Duration,
}

impl TickReport {
    /// Whether any storage call failed.
    pub fn had_failures(&self) -> bool {
        self.fetch_failures > 0 || self.write_failures > 0
    }
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    written: AtomicU64,
    restored: AtomicU64,
    fetch_failures: AtomicU64,
    write_failures: AtomicU64,
}

/// Totals across all ticks of a [`PersistenceCycle`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    pub ticks: u64,
    pub written: u64,
    pub restored: u64,
    pub fetch_failures: u64,
    pub write_failures: u64,
}

struct CycleState {
    cycle: u64,
    caches: HashMap<KindId, SessionCache>,
}

/// Flushes an [`AggregateStore`] to the storage adapters of its registered kinds.
pub struct PersistenceCycle {
    store: Arc<AggregateStore>,
    options: PersistenceOptions,
    // serializes ticks
    state: Mutex<CycleState>,
    phase: AtomicU8,
    stats: Counters,
}

impl PersistenceCycle {
    pub fn new(store: Arc<AggregateStore>, options: PersistenceOptions) -> Self {
        assert!(options.max_batch_size > 0, "max_batch_size must not be zero");
        Self {
            store,
            options,
            state: Mutex::new(CycleState {
                cycle: 0,
                caches: HashMap::new(),
            }),
            phase: AtomicU8::new(Phase::Idle as u8),
            stats: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<AggregateStore> {
        &self.store
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> PersistenceStats {
        PersistenceStats {
            ticks: self.stats.ticks.load(Ordering::Relaxed),
            written: self.stats.written.load(Ordering::Relaxed),
            restored: self.stats.restored.load(Ordering::Relaxed),
            fetch_failures: self.stats.fetch_failures.load(Ordering::Relaxed),
            write_failures: self.stats.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Run one flush. Safe to call while events are being merged; concurrent ticks run one
    /// after the other.
    pub fn tick(&self) -> TickReport {
        let start = Instant::now();
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.cycle += 1;
        let cycle = state.cycle;
        let mut report = TickReport {
            cycle,
            ..TickReport::default()
        };

        self.set_phase(Phase::Collecting);
        let drained = self.store.drain_dirty();
        report.drained = drained.len();

        for (kind_id, entries) in drained.into_inner().sorted_by_key(|(kind, _)| *kind) {
            let Some(kind) = self.store.registry().get(kind_id).cloned() else {
                // the store only accepts registered kinds
                continue;
            };
            let cache = state.caches.entry(kind_id).or_default();
            self.flush_kind(&kind, entries, cache, cycle, &mut report);
        }

        for cache in state.caches.values_mut() {
            report.evicted += cache.evict(cycle, self.options.cache_idle_cycles);
        }
        self.set_phase(Phase::Idle);
        drop(state);

        report.elapsed = start.elapsed();
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.stats.written.fetch_add(report.written as u64, Ordering::Relaxed);
        self.stats.restored.fetch_add(report.restored as u64, Ordering::Relaxed);
        self.stats
            .fetch_failures
            .fetch_add(report.fetch_failures as u64, Ordering::Relaxed);
        self.stats
            .write_failures
            .fetch_add(report.write_failures as u64, Ordering::Relaxed);
        if report.drained > 0 {
            tracing::debug!(
                cycle,
                drained = report.drained,
                written = report.written,
                restored = report.restored,
                elapsed = ?report.elapsed,
                "persistence tick finished"
            );
        }
        report
    }

    fn flush_kind(
        &self,
        kind: &AggregateKind,
        entries: Vec<(Identity, AggregateRecord)>,
        cache: &mut SessionCache,
        cycle: u64,
        report: &mut TickReport,
    ) {
        self.set_phase(Phase::Fetching);
        let to_fetch: Vec<Identity> = entries
            .iter()
            .filter(|(id, _)| !(kind.session_cache() && cache.contains(id)))
            .map(|(id, _)| id.clone())
            .collect();
        let mut snapshots = if to_fetch.is_empty() {
            HashMap::new()
        } else {
            match kind.storage().bulk_get(&to_fetch) {
                Ok(snapshots) => snapshots,
                Err(err) => {
                    rate_limited!(
                        Duration::from_secs(1),
                        tracing::error!(kind = %kind.id(), name = kind.name(), %err, "failed to read aggregates, will retry next tick")
                    );
                    report.fetch_failures += 1;
                    report.restored += entries.len();
                    self.store.restore(entries);
                    return;
                }
            }
        };
        report.fetched += snapshots.len();

        self.set_phase(Phase::Reconciling);
        let mut writes = Vec::with_capacity(entries.len());
        let mut deltas = HashMap::with_capacity(entries.len());
        for (id, delta) in entries {
            let prior = match snapshots.remove(&id) {
                Some(snapshot) => Some(snapshot),
                None if kind.session_cache() => {
                    let cached = cache.get(&id, cycle).cloned();
                    report.cache_hits += usize::from(cached.is_some());
                    cached
                }
                None => None,
            };
            if prior.is_some() && !kind.supports_update() {
                report.skipped += 1;
                continue;
            }
            match reconcile(kind.schema(), prior.as_ref(), &delta) {
                Ok(merged) => {
                    writes.push((id.clone(), merged));
                    deltas.insert(id, delta);
                }
                Err(err) => {
                    report.merge_errors += 1;
                    tracing::error!(%id, %err, "dropping delta that can't be reconciled with its stored aggregate");
                }
            }
        }

        self.set_phase(Phase::Writing);
        for chunk in writes.chunks(self.options.max_batch_size) {
            match kind.storage().bulk_upsert(chunk) {
                Ok(outcome) => {
                    for (id, merged) in chunk {
                        if outcome.failed.contains(id) {
                            if let Some(delta) = deltas.remove(id) {
                                report.restored += 1;
                                self.store.restore([(id.clone(), delta)]);
                            }
                        } else {
                            report.written += 1;
                            if kind.session_cache() {
                                cache.insert(id.clone(), merged.clone(), cycle);
                            }
                        }
                    }
                    if !outcome.is_complete() {
                        report.write_failures += 1;
                        rate_limited!(
                            Duration::from_secs(1),
                            tracing::error!(kind = %kind.id(), name = kind.name(), failed = outcome.failed.len(), "storage rejected some aggregates, will retry next tick")
                        );
                    }
                }
                Err(err) => {
                    report.write_failures += 1;
                    report.restored += chunk.len();
                    self.store
                        .restore(chunk.iter().filter_map(|(id, _)| deltas.remove_entry(id)));
                    rate_limited!(
                        Duration::from_secs(1),
                        tracing::error!(kind = %kind.id(), name = kind.name(), %err, "failed to write aggregates, will retry next tick")
                    );
                }
            }
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }
}

impl fmt::Debug for PersistenceCycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceCycle")
            .field("phase", &self.phase())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
