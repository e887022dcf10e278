// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Data model shared by the `tally` crates.
//!
//! An [`Event`] carries a sparse, positional delta for one aggregate [`Identity`]
//! (`kind`, `entity id`, [`TimeBucket`]). A [`MergeSchema`] describes, per field,
//! the [`FieldType`] and the [`MergeOp`] used to fold deltas into an
//! [`AggregateRecord`]. Everything else in the pipeline is plumbing around
//! those types.

pub mod bucket;
pub mod error;
pub mod event;
pub mod identity;
pub mod record;
pub mod schema;
pub mod value;

pub use bucket::{Granularity, TimeBucket};
pub use error::{BucketError, ConfigError, MergeError, StorageError};
pub use event::{Event, Payload};
pub use identity::{Identity, KindId};
pub use record::AggregateRecord;
pub use schema::{FieldDef, MergeOp, MergeSchema};
pub use value::{FieldType, FieldValue};
