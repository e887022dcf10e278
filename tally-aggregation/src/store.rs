// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory aggregate store.
//!
//! The store holds, per aggregate identity, the delta accumulated since the last
//! successful flush. It is split into shards, one per consumer thread; a shard is only
//! written by its thread, and the partition router guarantees that an identity is only
//! ever written through one shard. Each shard sits behind a single mutex that its thread
//! takes once per batch and the persistence cycle takes once per tick to swap the
//! working set out, so there is no per-record locking.

use std::{
    mem,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use hashbrown::HashMap;
use tally_core::{AggregateRecord, Event, Identity, KindId, MergeError};

use crate::registry::KindRegistry;

type WorkingSet = HashMap<Identity, AggregateRecord>;

/// Deltas taken out of the store by [`AggregateStore::drain_dirty`], grouped by kind.
#[derive(Debug, Default)]
pub struct Drained {
    pub(crate) by_kind: HashMap<KindId, Vec<(Identity, AggregateRecord)>>,
}

impl Drained {
    /// Total number of identities.
    pub fn len(&self) -> usize {
        self.by_kind.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.values().all(Vec::is_empty)
    }

    /// Deltas of one kind, in identity order.
    pub fn kind(&self, kind: KindId) -> &[(Identity, AggregateRecord)] {
        self.by_kind.get(&kind).map_or(&[], Vec::as_slice)
    }

    /// Delta for one identity.
    pub fn get(&self, id: &Identity) -> Option<&AggregateRecord> {
        self.kind(id.kind())
            .iter()
            .find(|(candidate, _)| candidate == id)
            .map(|(_, record)| record)
    }

    pub fn into_inner(self) -> impl Iterator<Item = (KindId, Vec<(Identity, AggregateRecord)>)> {
        self.by_kind.into_iter()
    }
}

#[derive(Debug, Default)]
struct Counters {
    merged: AtomicU64,
    merge_errors: AtomicU64,
}

/// Point-in-time counters of an [`AggregateStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Events merged.
    pub merged: u64,
    /// Events rejected by their kind's merge schema.
    pub merge_errors: u64,
}

#[derive(Debug)]
pub struct AggregateStore {
    registry: Arc<KindRegistry>,
    shards: Box<[Mutex<WorkingSet>]>,
    // deltas of failed flushes, older than anything in the shards
    retry: Mutex<WorkingSet>,
    stats: Counters,
}

impl AggregateStore {
    /// A store with `shards` shards, normally one per consumer thread.
    pub fn new(registry: Arc<KindRegistry>, shards: usize) -> Self {
        Self {
            registry,
            shards: (0..shards.max(1)).map(|_| Mutex::default()).collect(),
            retry: Mutex::default(),
            stats: Counters::default(),
        }
    }

    pub fn registry(&self) -> &Arc<KindRegistry> {
        &self.registry
    }

    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Merge one event into `shard`.
    pub fn apply(&self, shard: usize, event: &Event) -> Result<(), MergeError> {
        let mut working = self.shard(shard);
        let result = self.apply_locked(&mut working, event);
        self.count(&result);
        result
    }

    /// Merge a batch into `shard` under a single lock acquisition.
    ///
    /// Events that fail to merge are passed to `on_failure` and leave their aggregate
    /// unchanged; the rest of the batch is still applied. Returns how many were merged.
    pub fn apply_batch(
        &self,
        shard: usize,
        events: &[Event],
        mut on_failure: impl FnMut(&Event, MergeError),
    ) -> usize {
        let mut failures = vec![];
        let mut merged = 0;
        {
            let mut working = self.shard(shard);
            for event in events {
                match self.apply_locked(&mut working, event) {
                    Ok(()) => merged += 1,
                    Err(err) => failures.push((event, err)),
                }
            }
        }
        self.stats.merged.fetch_add(merged as u64, Ordering::Relaxed);
        self.stats
            .merge_errors
            .fetch_add(failures.len() as u64, Ordering::Relaxed);
        for (event, err) in failures {
            on_failure(event, err);
        }
        merged
    }

    fn apply_locked(&self, working: &mut WorkingSet, event: &Event) -> Result<(), MergeError> {
        let identity = event.identity();
        let kind = self
            .registry
            .get(identity.kind())
            .ok_or(MergeError::UnknownKind(identity.kind()))?;
        let schema = kind.schema();
        match working.get_mut(identity) {
            Some(record) => schema.apply(record, event.payload()),
            None => {
                let mut record = schema.new_record();
                schema.apply(&mut record, event.payload())?;
                working.insert(identity.clone(), record);
                Ok(())
            }
        }
    }

    /// Swap every shard's working set for an empty one and return what was in them,
    /// together with deltas handed back by [`AggregateStore::restore`].
    ///
    /// Minute deltas of kinds with rollups are also folded into their hour/day identities.
    pub fn drain_dirty(&self) -> Drained {
        let mut out = mem::take(&mut *lock(&self.retry));
        let mut fresh = vec![];
        for shard in self.shards.iter() {
            let working = mem::take(&mut *lock(shard));
            fresh.extend(working);
        }
        // identity order puts earlier buckets first, so Overwrite rollups keep the latest minute
        fresh.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

        for (id, delta) in fresh {
            if let Some(kind) = self.registry.get(id.kind()) {
                for &granularity in kind.rollups() {
                    if granularity <= id.bucket().granularity() {
                        continue;
                    }
                    match id.rollup(granularity) {
                        Ok(rollup) => self.fold(&mut out, rollup, delta.clone()),
                        Err(err) => tracing::error!(%id, %err, "cannot roll up aggregate"),
                    }
                }
            }
            self.fold(&mut out, id, delta);
        }

        let mut drained = Drained::default();
        for (id, record) in out {
            drained.by_kind.entry(id.kind()).or_default().push((id, record));
        }
        for entries in drained.by_kind.values_mut() {
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
        }
        drained
    }

    /// Hand back deltas whose flush failed, to be retried on the next drain.
    ///
    /// Restored deltas count as older than anything merged since they were drained: summed
    /// fields add up and newer overwrites win.
    pub fn restore(&self, entries: impl IntoIterator<Item = (Identity, AggregateRecord)>) {
        let mut retry = lock(&self.retry);
        for (id, delta) in entries {
            self.fold(&mut retry, id, delta);
        }
    }

    /// Number of identities waiting for the next flush, rollups not included.
    pub fn dirty_len(&self) -> usize {
        let retry = lock(&self.retry).len();
        self.shards.iter().map(|shard| lock(shard).len()).sum::<usize>() + retry
    }

    /// The pending delta for `id`, combined across the retry set and shards.
    pub fn pending(&self, id: &Identity) -> Option<AggregateRecord> {
        let schema = self.registry.get(id.kind())?.schema().clone();
        let mut found = lock(&self.retry).get(id).cloned();
        for shard in self.shards.iter() {
            if let Some(delta) = lock(shard).get(id) {
                found = Some(match found {
                    Some(older) => schema.combine(&older, delta).ok()?,
                    None => delta.clone(),
                });
            }
        }
        found
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            merged: self.stats.merged.load(Ordering::Relaxed),
            merge_errors: self.stats.merge_errors.load(Ordering::Relaxed),
        }
    }

    // fold `newer` into whatever `set` already holds for `id`
    fn fold(&self, set: &mut WorkingSet, id: Identity, newer: AggregateRecord) {
        let Some(older) = set.remove(&id) else {
            set.insert(id, newer);
            return;
        };
        let Some(kind) = self.registry.get(id.kind()) else {
            set.insert(id, older);
            return;
        };
        match kind.schema().combine(&older, &newer) {
            Ok(combined) => {
                set.insert(id, combined);
            }
            Err(err) => {
                self.stats.merge_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%id, %err, "dropping delta that can't be combined with pending state");
                set.insert(id, older);
            }
        }
    }

    fn shard(&self, shard: usize) -> MutexGuard<'_, WorkingSet> {
        lock(&self.shards[shard % self.shards.len()])
    }

    fn count(&self, result: &Result<(), MergeError>) {
        let counter = match result {
            Ok(()) => &self.stats.merged,
            Err(_) => &self.stats.merge_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// A panicking consumer can't leave a working set half-merged (apply validates first), so
// a poisoned lock is still safe to use.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use tally_core::{FieldDef, FieldType, Granularity, MergeSchema, TimeBucket};

    use super::*;
    use crate::{registry::AggregateKind, storage::InMemoryStorage};

    const CPM: KindId = KindId(1);
    const CALLS: usize = 0;
    const LABEL: usize = 1;

    fn store(shards: usize) -> AggregateStore {
        let schema = MergeSchema::new([
            FieldDef::sum("calls", FieldType::Long),
            FieldDef::overwrite("label", FieldType::Str),
        ])
        .unwrap();
        let kind = AggregateKind::builder(CPM, "service_cpm")
            .schema(schema)
            .storage(Arc::new(InMemoryStorage::new()))
            .rollup(Granularity::Hour)
            .build()
            .unwrap();
        AggregateStore::new(Arc::new(KindRegistry::builder().register(kind).unwrap().build()), shards)
    }

    fn event(entity: &str, minute: i64) -> Event {
        Event::for_entity(CPM, entity, TimeBucket::from_raw(minute).unwrap())
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let store = store(1);
        let event = Event::for_entity(KindId(99), "x", TimeBucket::from_raw(20240101).unwrap());
        check!(store.apply(0, &event) == Err(MergeError::UnknownKind(KindId(99))));
        check!(store.stats().merge_errors == 1);
    }

    #[test]
    fn batch_failures_are_isolated() {
        let store = store(1);
        let batch = vec![
            event("a", 202401010930).with(CALLS, 1i64),
            event("a", 202401010930).with(CALLS, "oops"),
            event("a", 202401010930).with(CALLS, 2i64),
        ];
        let mut failures = vec![];
        let merged = store.apply_batch(0, &batch, |event, err| failures.push((event.clone(), err)));
        check!(merged == 2);
        check!(failures.len() == 1);

        let id = batch[0].identity().clone();
        check!(store.pending(&id).unwrap().long(CALLS) == Some(3));
    }

    #[test]
    fn drain_swaps_out_working_set() {
        let store = store(2);
        store.apply(0, &event("a", 202401010930).with(CALLS, 1i64)).unwrap();
        store.apply(1, &event("b", 202401010930).with(CALLS, 1i64)).unwrap();
        check!(store.dirty_len() == 2);

        let drained = store.drain_dirty();
        // two minutes plus two hour rollups
        check!(drained.len() == 4);
        check!(store.dirty_len() == 0);
        check!(store.drain_dirty().is_empty());
    }

    #[test]
    fn rollups_fold_minutes_in_order() {
        let store = store(1);
        store
            .apply(0, &event("a", 202401010931).with(CALLS, 2i64).with(LABEL, "late"))
            .unwrap();
        store
            .apply(0, &event("a", 202401010930).with(CALLS, 1i64).with(LABEL, "early"))
            .unwrap();
        let drained = store.drain_dirty();
        let hour = Identity::new(CPM, "a", TimeBucket::from_raw(2024010109).unwrap());
        let rollup = drained.get(&hour).unwrap();
        check!(rollup.long(CALLS) == Some(3));
        check!(rollup.str(LABEL) == Some("late"));
    }

    #[test]
    fn restored_deltas_sit_under_newer_ones() {
        let store = store(1);
        store
            .apply(0, &event("a", 202401010930).with(CALLS, 5i64).with(LABEL, "old"))
            .unwrap();
        let drained = store.drain_dirty();

        store
            .apply(0, &event("a", 202401010930).with(CALLS, 1i64).with(LABEL, "new"))
            .unwrap();
        store.restore(drained.into_inner().flat_map(|(_, entries)| entries));

        let drained = store.drain_dirty();
        let minute = event("a", 202401010930).identity().clone();
        let record = drained.get(&minute).unwrap();
        check!(record.long(CALLS) == Some(6));
        check!(record.str(LABEL) == Some("new"));
        // the restored hour rollup already had 5, the new minute delta adds 1
        let hour = minute.rollup(Granularity::Hour).unwrap();
        check!(drained.get(&hour).unwrap().long(CALLS) == Some(6));
    }
}
