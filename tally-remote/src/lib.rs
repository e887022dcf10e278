// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(docsrs, feature(doc_cfg))]

//! Remote routing between collector nodes.
//!
//! Events whose partition is owned by another node are encoded with a positional
//! [`RemoteSchema`], framed with a length prefix and streamed over TCP by a
//! [`RemoteClient`]. The owning node runs a [`RemoteReceiver`] that decodes them and
//! hands them to its local pipeline. Delivery is best effort: a failed send is logged and
//! the event is dropped, it is never retried and never fails the caller.

use tally_core::{BucketError, FieldType, KindId, MergeError};

pub mod client;
pub mod codec;
pub mod receiver;
pub mod schema;

pub use client::{RemoteClient, RemoteClientConfig, RemoteClientStats};
pub use codec::{EventCodec, RemoteMessage, WIRE_VERSION};
pub use receiver::{EventSink, RemoteReceiver, RemoteReceiverStats};
pub use schema::{RemoteData, RemoteSchema, RemoteSchemas};

/// Largest frame either end accepts.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Failure to encode or decode a remote message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("unsupported wire version {0}")]
    BadVersion(u8),
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("{0} is too long to encode")]
    TooLong(&'static str),
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
    #[error("{what} flag is {value}, expected 0 or 1")]
    BadFlag { what: &'static str, value: u8 },
    #[error("no remote schema for kind {0}")]
    UnknownKind(KindId),
    #[error("{list} list has {actual} entries, schema expects {expected}")]
    ListLength {
        list: FieldType,
        expected: usize,
        actual: usize,
    },
    #[error("record has {actual} fields, schema expects {expected}")]
    FieldCount { expected: usize, actual: usize },
    #[error("field {index} holds a {actual}, schema expects {expected}")]
    SlotType {
        index: usize,
        expected: FieldType,
        actual: FieldType,
    },
    #[error("field mask {mask:#x} names fields beyond the {len} the schema has")]
    BadMask { mask: u64, len: usize },
    #[error(transparent)]
    Bucket(#[from] BucketError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}
