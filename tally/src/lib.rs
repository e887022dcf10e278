// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(docsrs, feature(doc_cfg))]

//! Streaming metrics aggregation.
//!
//! Producers hand [`Event`]s to a [`Pipeline`]. Each event is routed by its partition key
//! to the node that owns the partition and, locally, to one lane of a bounded buffer. Every
//! lane is drained by exactly one consumer thread, so every aggregate has a single writer.
//! Consumers merge events into an in-memory store using each kind's [`MergeSchema`], and a
//! persistence thread periodically flushes what changed, reconciling it with what storage
//! already holds.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tally::aggregation::{AggregateKind, InMemoryStorage, KindRegistry};
//! use tally::{Event, FieldDef, FieldType, KindId, MergeSchema, Pipeline, PipelineConfig, TimeBucket};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let schema = MergeSchema::new([
//!     FieldDef::sum("calls", FieldType::Long),
//!     FieldDef::sum("duration", FieldType::Long),
//! ])?;
//! let registry = KindRegistry::builder()
//!     .register(
//!         AggregateKind::builder(KindId(1), "service_resp_time")
//!             .schema(schema)
//!             .storage(Arc::new(InMemoryStorage::new()))
//!             .build()?,
//!     )?
//!     .build();
//! let pipeline = Pipeline::builder(PipelineConfig::default(), Arc::new(registry)).build()?;
//!
//! let bucket = TimeBucket::current_minute();
//! pipeline.dispatch(Event::for_entity(KindId(1), "svc-42", bucket).with(0, 1i64).with(1, 120i64))?;
//! pipeline.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod pipeline;
pub mod worker;

pub use config::{PipelineConfig, RemoteConfig};
pub use dispatch::{DispatchError, Dispatcher, IngestReport};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineStats};
pub use worker::{LocalWorker, PartitionOwner, RemoteWorker, Worker, WorkerTable};

pub use tally_core::{
    AggregateRecord, BucketError, ConfigError, Event, FieldDef, FieldType, FieldValue,
    Granularity, Identity, KindId, MergeError, MergeOp, MergeSchema, Payload, StorageError,
    TimeBucket,
};

/// Aggregate store, kind registry, storage contract and persistence.
pub use tally_aggregation as aggregation;
/// Buffer, router and consumer pool.
pub use tally_queue as queue;
/// Remote routing between nodes.
pub use tally_remote as remote;
