// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Analysis events.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::{FieldValue, Identity, KindId, MergeSchema, TimeBucket};

/// Sparse positional delta: `(field index, value)` pairs. Fields not mentioned are untouched.
pub type Payload = SmallVec<[(usize, FieldValue); 4]>;

/// An immutable unit of analysis input.
///
/// The partition key is used only to pick a lane. By default it is the entity id.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    identity: Identity,
    payload: Payload,
    partition_key: Option<Arc<str>>,
}

impl Event {
    /// An event with an empty payload, partitioned by entity id.
    pub fn new(identity: Identity) -> Self {
        let partition_key = Some(Arc::clone(identity.entity_id_arc()));
        Self {
            identity,
            payload: Payload::new(),
            partition_key,
        }
    }

    /// Shorthand for `Event::new(Identity::new(kind, entity_id, bucket))`.
    pub fn for_entity(kind: KindId, entity_id: impl Into<Arc<str>>, bucket: TimeBucket) -> Self {
        Self::new(Identity::new(kind, entity_id, bucket))
    }

    /// Add a field delta by position.
    pub fn with(mut self, index: usize, value: impl Into<FieldValue>) -> Self {
        self.payload.push((index, value.into()));
        self
    }

    /// Add a field delta by name. Names the schema doesn't know are skipped, see
    /// [`Event::try_with_named`] to detect them.
    pub fn with_named(self, schema: &MergeSchema, name: &str, value: impl Into<FieldValue>) -> Self {
        match self.try_with_named(schema, name, value) {
            Ok(event) | Err(event) => event,
        }
    }

    /// Add a field delta by name, handing the event back unchanged if the schema has no such field.
    pub fn try_with_named(
        self,
        schema: &MergeSchema,
        name: &str,
        value: impl Into<FieldValue>,
    ) -> Result<Self, Self> {
        match schema.index_of(name) {
            Some(index) => Ok(self.with(index, value)),
            None => Err(self),
        }
    }

    /// Replace the partition key. `None` makes the event unroutable by key-based policies.
    pub fn with_partition_key(mut self, key: Option<impl Into<Arc<str>>>) -> Self {
        self.partition_key = key.map(Into::into);
        self
    }

    /// The aggregate this event contributes to.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The delta.
    pub fn payload(&self) -> &[(usize, FieldValue)] {
        &self.payload
    }

    /// The routing key.
    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// Split into parts, used when re-encoding for another process.
    pub fn into_parts(self) -> (Identity, Payload, Option<Arc<str>>) {
        (self.identity, self.payload, self.partition_key)
    }

    /// Reassemble an event from its parts.
    pub fn from_parts(identity: Identity, payload: Payload, partition_key: Option<Arc<str>>) -> Self {
        Self {
            identity,
            payload,
            partition_key,
        }
    }
}
