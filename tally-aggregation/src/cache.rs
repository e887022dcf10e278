// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Last-persisted values kept between flushes.

use hashbrown::HashMap;
use tally_core::{AggregateRecord, Identity};

struct Entry {
    record: AggregateRecord,
    last_used: u64,
}

/// Records this process wrote, by identity.
///
/// Because every identity has a single writer, a value written here is still the
/// persisted value on the next flush, so it can stand in for a storage read. Only
/// successfully written values are cached; pending deltas live in the store.
#[derive(Default)]
pub(crate) struct SessionCache {
    entries: HashMap<Identity, Entry>,
}

impl SessionCache {
    pub(crate) fn get(&mut self, id: &Identity, cycle: u64) -> Option<&AggregateRecord> {
        let entry = self.entries.get_mut(id)?;
        entry.last_used = cycle;
        Some(&entry.record)
    }

    pub(crate) fn contains(&self, id: &Identity) -> bool {
        self.entries.contains_key(id)
    }

    pub(crate) fn insert(&mut self, id: Identity, record: AggregateRecord, cycle: u64) {
        self.entries.insert(
            id,
            Entry {
                record,
                last_used: cycle,
            },
        );
    }

    /// Drop entries not used in the last `idle_cycles` cycles. Returns how many were dropped.
    pub(crate) fn evict(&mut self, cycle: u64, idle_cycles: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| cycle.saturating_sub(entry.last_used) < idle_cycles);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
