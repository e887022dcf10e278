// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contract between the persistence cycle and storage backends.

use std::{collections::HashMap, sync::Mutex};

use tally_core::{AggregateRecord, Identity, StorageError};

/// Result of a [`StorageAdapter::bulk_upsert`] that reached the backend.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Identities the backend did not persist. Everything else in the batch was written.
    pub failed: Vec<Identity>,
}

impl UpsertOutcome {
    /// Every record was written.
    pub fn complete() -> Self {
        Self::default()
    }

    /// Some records were not written.
    pub fn partial(failed: Vec<Identity>) -> Self {
        Self { failed }
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A storage backend for one or more aggregate kinds.
///
/// Backends only need to read and write whole records by identity. Calls are made from
/// the persistence thread, never from ingestion or consumer threads, so they may block.
pub trait StorageAdapter: Send + Sync {
    /// Fetch the persisted snapshots of `ids`. Identities with nothing stored are left out of the map.
    fn bulk_get(&self, ids: &[Identity]) -> Result<HashMap<Identity, AggregateRecord>, StorageError>;

    /// Insert or replace `records`.
    ///
    /// `Err` means nothing is known to be written; a partial failure is reported through
    /// [`UpsertOutcome::failed`].
    fn bulk_upsert(&self, records: &[(Identity, AggregateRecord)]) -> Result<UpsertOutcome, StorageError>;
}

/// A [`StorageAdapter`] keeping records in a map. Suitable for tests and single-node setups
/// that only need the latest aggregates in memory.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    records: Mutex<HashMap<Identity, AggregateRecord>>,
    #[cfg(feature = "test-util")]
    faults: Mutex<faults::Faults>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored record for `id`.
    pub fn get(&self, id: &Identity) -> Option<AggregateRecord> {
        self.lock().get(id).cloned()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of everything stored.
    pub fn snapshot(&self) -> HashMap<Identity, AggregateRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Identity, AggregateRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StorageAdapter for InMemoryStorage {
    fn bulk_get(&self, ids: &[Identity]) -> Result<HashMap<Identity, AggregateRecord>, StorageError> {
        #[cfg(feature = "test-util")]
        self.before_get()?;
        let records = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|record| (id.clone(), record.clone())))
            .collect())
    }

    fn bulk_upsert(&self, records: &[(Identity, AggregateRecord)]) -> Result<UpsertOutcome, StorageError> {
        #[cfg(feature = "test-util")]
        let rejected = self.before_upsert()?;
        #[cfg(not(feature = "test-util"))]
        let rejected: &[Identity] = &[];

        let mut stored = self.lock();
        let mut failed = vec![];
        for (id, record) in records {
            if rejected.contains(id) {
                failed.push(id.clone());
            } else {
                stored.insert(id.clone(), record.clone());
            }
        }
        Ok(UpsertOutcome { failed })
    }
}

#[cfg(feature = "test-util")]
mod faults {
    use tally_core::{Identity, StorageError};

    use super::InMemoryStorage;

    #[derive(Debug, Default)]
    pub(super) struct Faults {
        get_failures: usize,
        upsert_failures: usize,
        reject: Vec<Identity>,
        gets: usize,
        upserts: usize,
    }

    impl InMemoryStorage {
        fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
            self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Make the next `count` calls to `bulk_get` fail.
        pub fn fail_next_gets(&self, count: usize) {
            self.faults().get_failures = count;
        }

        /// Make the next `count` calls to `bulk_upsert` fail entirely.
        pub fn fail_next_upserts(&self, count: usize) {
            self.faults().upsert_failures = count;
        }

        /// Report these identities as failed on every `bulk_upsert` until cleared.
        pub fn reject(&self, ids: Vec<Identity>) {
            self.faults().reject = ids;
        }

        /// Number of `bulk_get` calls so far, failed ones included.
        pub fn gets(&self) -> usize {
            self.faults().gets
        }

        /// Number of `bulk_upsert` calls so far, failed ones included.
        pub fn upserts(&self) -> usize {
            self.faults().upserts
        }

        pub(super) fn before_get(&self) -> Result<(), StorageError> {
            let mut faults = self.faults();
            faults.gets += 1;
            if faults.get_failures > 0 {
                faults.get_failures -= 1;
                return Err(StorageError::Unavailable("injected read failure".into()));
            }
            Ok(())
        }

        pub(super) fn before_upsert(&self) -> Result<Vec<Identity>, StorageError> {
            let mut faults = self.faults();
            faults.upserts += 1;
            if faults.upsert_failures > 0 {
                faults.upsert_failures -= 1;
                return Err(StorageError::Unavailable("injected write failure".into()));
            }
            Ok(faults.reject.clone())
        }
    }
}
