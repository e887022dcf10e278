// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Aggregate identities.

use std::{fmt, sync::Arc};

use crate::{BucketError, Granularity, TimeBucket};

/// Identifier of a registered metric kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct KindId(pub u16);

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The globally unique key of an aggregate: `(kind, entity id, time bucket)`.
///
/// Cloning is cheap, the entity id is reference counted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    kind: KindId,
    entity_id: Arc<str>,
    bucket: TimeBucket,
}

impl Identity {
    /// Create an identity.
    pub fn new(kind: KindId, entity_id: impl Into<Arc<str>>, bucket: TimeBucket) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            bucket,
        }
    }

    /// The metric kind.
    pub fn kind(&self) -> KindId {
        self.kind
    }

    /// The entity this aggregate describes.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Shared handle to the entity id.
    pub fn entity_id_arc(&self) -> &Arc<str> {
        &self.entity_id
    }

    /// The time bucket.
    pub fn bucket(&self) -> TimeBucket {
        self.bucket
    }

    /// The same kind and entity in the enclosing bucket of a coarser granularity.
    pub fn rollup(&self, granularity: Granularity) -> Result<Self, BucketError> {
        Ok(Self {
            kind: self.kind,
            entity_id: Arc::clone(&self.entity_id),
            bucket: self.bucket.truncate(granularity)?,
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.kind, self.entity_id, self.bucket)
    }
}
