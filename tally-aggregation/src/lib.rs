// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(docsrs, feature(doc_cfg))]

//! Aggregation side of the `tally` pipeline.
//!
//! Consumer threads merge events into an [`AggregateStore`]; a [`PersistenceCycle`],
//! ticked by a [`PersistenceTimer`], periodically drains what changed, reconciles it
//! with what storage already has and writes it back through each kind's
//! [`StorageAdapter`].

mod cache;
pub mod consumer;
pub mod persistence;
pub mod registry;
pub mod storage;
pub mod store;
pub mod timer;

pub use consumer::{MergeConsumer, MergeFailures};
pub use persistence::{
    Phase, PersistenceCycle, PersistenceOptions, PersistenceStats, TickReport, reconcile,
};
pub use registry::{AggregateKind, AggregateKindBuilder, KindRegistry, KindRegistryBuilder};
pub use storage::{InMemoryStorage, StorageAdapter, UpsertOutcome};
pub use store::{AggregateStore, Drained, StoreStats};
pub use timer::{PersistenceTimer, PersistenceTimerBuilder};
