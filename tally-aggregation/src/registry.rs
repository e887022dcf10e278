// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Static registration table of aggregate kinds.
//!
//! Every metric kind the pipeline aggregates is registered once at startup with its
//! [`MergeSchema`] and [`StorageAdapter`]. There is no discovery: a kind that isn't in
//! the table is rejected when its first event is merged.

use std::{collections::HashMap, fmt, sync::Arc};

use tally_core::{ConfigError, Granularity, KindId, MergeSchema};

use crate::storage::StorageAdapter;

/// One registered metric kind.
pub struct AggregateKind {
    id: KindId,
    name: String,
    schema: MergeSchema,
    storage: Arc<dyn StorageAdapter>,
    rollups: Vec<Granularity>,
    supports_update: bool,
    session_cache: bool,
}

impl fmt::Debug for AggregateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateKind")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("fields", &self.schema.len())
            .field("rollups", &self.rollups)
            .field("supports_update", &self.supports_update)
            .field("session_cache", &self.session_cache)
            .finish_non_exhaustive()
    }
}

impl AggregateKind {
    pub fn builder(id: KindId, name: impl Into<String>) -> AggregateKindBuilder {
        AggregateKindBuilder {
            id,
            name: name.into(),
            schema: None,
            storage: None,
            rollups: vec![],
            supports_update: true,
            session_cache: true,
        }
    }

    pub fn id(&self) -> KindId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &MergeSchema {
        &self.schema
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    /// Coarser buckets that minute deltas of this kind are also folded into.
    pub fn rollups(&self) -> &[Granularity] {
        &self.rollups
    }

    /// If false, an aggregate that already exists in storage is never rewritten.
    pub fn supports_update(&self) -> bool {
        self.supports_update
    }

    /// Whether the last written value is kept in memory to skip the storage read on the next flush.
    pub fn session_cache(&self) -> bool {
        self.session_cache
    }
}

/// Builder for [`AggregateKind`].
pub struct AggregateKindBuilder {
    id: KindId,
    name: String,
    schema: Option<MergeSchema>,
    storage: Option<Arc<dyn StorageAdapter>>,
    rollups: Vec<Granularity>,
    supports_update: bool,
    session_cache: bool,
}

impl AggregateKindBuilder {
    /// Merge schema. Required.
    pub fn schema(mut self, schema: MergeSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Storage adapter. Required.
    pub fn storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Also aggregate into the enclosing bucket of `granularity`, e.g. hourly and daily totals
    /// alongside per-minute ones.
    pub fn rollup(mut self, granularity: Granularity) -> Self {
        if !self.rollups.contains(&granularity) {
            self.rollups.push(granularity);
            self.rollups.sort();
        }
        self
    }

    /// Insert-only kinds never overwrite an aggregate that storage already has. Defaults to true.
    pub fn supports_update(mut self, supports_update: bool) -> Self {
        self.supports_update = supports_update;
        self
    }

    /// Defaults to true.
    pub fn session_cache(mut self, enabled: bool) -> Self {
        self.session_cache = enabled;
        self
    }

    pub fn build(self) -> Result<AggregateKind, ConfigError> {
        let describe = || format!("kind {} ({})", self.id, self.name);
        let schema = self
            .schema
            .clone()
            .ok_or_else(|| ConfigError::Invalid(format!("{} has no merge schema", describe())))?;
        let storage = self
            .storage
            .clone()
            .ok_or_else(|| ConfigError::Invalid(format!("{} has no storage adapter", describe())))?;
        if self.rollups.contains(&Granularity::Minute) {
            return Err(ConfigError::Invalid(format!(
                "{} can't roll up into minute buckets",
                describe()
            )));
        }
        Ok(AggregateKind {
            id: self.id,
            name: self.name,
            schema,
            storage,
            rollups: self.rollups,
            supports_update: self.supports_update,
            session_cache: self.session_cache,
        })
    }
}

/// Registered kinds by id. Built once, then shared read-only.
#[derive(Debug, Default)]
pub struct KindRegistry {
    kinds: HashMap<KindId, Arc<AggregateKind>>,
}

impl KindRegistry {
    pub fn builder() -> KindRegistryBuilder {
        KindRegistryBuilder::default()
    }

    pub fn get(&self, kind: KindId) -> Option<&Arc<AggregateKind>> {
        self.kinds.get(&kind)
    }

    /// All kinds, in id order.
    pub fn kinds(&self) -> impl Iterator<Item = &Arc<AggregateKind>> {
        let mut kinds: Vec<_> = self.kinds.values().collect();
        kinds.sort_by_key(|kind| kind.id());
        kinds.into_iter()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct KindRegistryBuilder {
    kinds: HashMap<KindId, Arc<AggregateKind>>,
}

impl KindRegistryBuilder {
    /// Register a kind. Each id can only be registered once.
    pub fn register(mut self, kind: AggregateKind) -> Result<Self, ConfigError> {
        let id = kind.id();
        if self.kinds.contains_key(&id) {
            return Err(ConfigError::DuplicateKind(id));
        }
        tracing::debug!(kind = %id, name = kind.name(), "registered aggregate kind");
        self.kinds.insert(id, Arc::new(kind));
        Ok(self)
    }

    pub fn build(self) -> KindRegistry {
        KindRegistry { kinds: self.kinds }
    }
}
