// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Mergeable aggregate records.

use crate::{FieldValue, MergeError, MergeSchema};

/// Positional field values of one aggregate, laid out as described by its [`MergeSchema`].
///
/// A record remembers which fields have been written. Unwritten fields hold the type's
/// zero value and never override a written value when two records are combined, so a
/// delta that never touched an `Overwrite` field leaves the persisted value alone.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregateRecord {
    pub(crate) values: Vec<FieldValue>,
    pub(crate) set: u64,
}

impl AggregateRecord {
    /// Build a fully-populated record, e.g. a snapshot read back from storage.
    pub fn from_values(schema: &MergeSchema, values: Vec<FieldValue>) -> Result<Self, MergeError> {
        if values.len() != schema.len() {
            return Err(MergeError::FieldOutOfRange {
                index: values.len(),
                len: schema.len(),
            });
        }
        for (def, value) in schema.fields().iter().zip(&values) {
            if def.ty() != value.ty() {
                return Err(MergeError::TypeMismatch {
                    field: def.name().to_owned(),
                    expected: def.ty(),
                    actual: value.ty(),
                });
            }
        }
        let set = if values.len() == 64 {
            u64::MAX
        } else {
            (1u64 << values.len()) - 1
        };
        Ok(Self { values, set })
    }

    /// Value at `index`, or `None` if the index is past the end of the record.
    ///
    /// Fields that were never written hold their type's zero value.
    pub fn get(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index)
    }

    /// Whether the field at `index` has been written.
    pub fn is_set(&self, index: usize) -> bool {
        index < self.values.len() && self.set & (1 << index) != 0
    }

    /// All values in schema order.
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Consume the record, returning its values in schema order.
    pub fn into_values(self) -> Vec<FieldValue> {
        self.values
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the record has no fields. Never true for records built from a valid schema.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Shorthand for reading a long field.
    pub fn long(&self, index: usize) -> Option<i64> {
        self.get(index).and_then(FieldValue::as_long)
    }

    /// Shorthand for reading a double field.
    pub fn double(&self, index: usize) -> Option<f64> {
        self.get(index).and_then(FieldValue::as_double)
    }

    /// Shorthand for reading a string field.
    pub fn str(&self, index: usize) -> Option<&str> {
        self.get(index).and_then(FieldValue::as_str)
    }
}
