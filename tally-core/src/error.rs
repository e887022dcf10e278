// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across the pipeline.

use crate::{FieldType, KindId};

/// A pipeline component was configured with values it can't run with.
///
/// These are raised while building the pipeline, before any traffic is accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A buffer was built with no channels.
    #[error("channel count must be at least 1")]
    ZeroChannels,
    /// A size or count that must be positive was zero.
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    /// A merge schema was declared with no fields.
    #[error("merge schema has no fields")]
    EmptySchema,
    /// A merge schema exceeded [`crate::schema::MAX_FIELDS`].
    #[error("merge schema has {0} fields, at most {max} are supported", max = crate::schema::MAX_FIELDS)]
    TooManyFields(usize),
    /// Two fields in one schema share a name.
    #[error("duplicate field `{0}` in merge schema")]
    DuplicateField(String),
    /// `Sum` was declared on a type with no 64-bit accumulator.
    #[error("field `{field}` can't use Sum with {ty} values, only long and double fields can be summed")]
    SumNotSupported {
        /// Field name.
        field: String,
        /// Declared type.
        ty: FieldType,
    },
    /// A kind was registered more than once.
    #[error("kind {0} is already registered")]
    DuplicateKind(KindId),
    /// Anything else that fails validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A delta couldn't be merged into an aggregate.
///
/// Merge errors are reported per event; the rest of the batch is still applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// No schema is registered for the event's kind.
    #[error("no merge schema registered for kind {0}")]
    UnknownKind(KindId),
    /// The payload names a field position past the end of the schema.
    #[error("field index {index} is out of range for a schema with {len} fields")]
    FieldOutOfRange {
        /// Offending position.
        index: usize,
        /// Number of fields in the schema.
        len: usize,
    },
    /// The payload value doesn't have the declared field type.
    #[error("field `{field}` expects a {expected} value, got {actual}")]
    TypeMismatch {
        /// Field name.
        field: String,
        /// Declared type.
        expected: FieldType,
        /// Type found in the payload or snapshot.
        actual: FieldType,
    },
    /// A long `Sum` field overflowed.
    #[error("field `{0}` overflowed its 64-bit accumulator")]
    Overflow(String),
}

/// A time bucket value couldn't be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BucketError {
    /// The value has a digit count that matches no granularity.
    #[error("time bucket {0} is not a day (YYYYMMDD), hour (YYYYMMDDHH) or minute (YYYYMMDDHHmm) bucket")]
    BadWidth(i64),
    /// The value has the right width but names an impossible date or time.
    #[error("time bucket {0} is not a valid calendar time")]
    BadCalendar(i64),
    /// A bucket can only be truncated to a coarser granularity.
    #[error("can't convert time bucket {0} to a finer granularity")]
    Finer(i64),
}

/// A storage adapter call failed.
///
/// Storage failures are retried on the next persistence tick and never reach producers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// The backend could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// The backend answered but rejected the request.
    #[error("storage rejected request: {0}")]
    Rejected(String),
    /// A snapshot returned by the backend doesn't fit the kind's schema.
    #[error("corrupt snapshot: {0}")]
    Corrupt(#[from] MergeError),
}
