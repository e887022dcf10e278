// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-field merge semantics.
//!
//! Every metric kind declares an ordered, fixed list of [`FieldDef`]s. The same
//! [`MergeOp`]s are used both when an event delta is folded into the in-memory
//! aggregate ([`MergeSchema::apply`]) and when an in-memory delta is reconciled
//! with a persisted snapshot ([`MergeSchema::combine`]).
//!
//! Summed fields accumulate in 64 bits: `long` fields use checked `i64` addition and
//! report [`MergeError::Overflow`] rather than saturating, `double` fields use `f64`
//! addition.

use std::{borrow::Cow, collections::HashSet, sync::Arc};

use smallvec::SmallVec;

use crate::{AggregateRecord, ConfigError, FieldType, FieldValue, MergeError};

/// Maximum number of fields in one schema.
pub const MAX_FIELDS: usize = 64;

/// How a new value combines with the existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum MergeOp {
    /// Last write wins. Used for labels and dimensions.
    Overwrite,
    /// Values are added. Used for counters and duration sums.
    Sum,
    /// Set once when the aggregate is created and never changed.
    Identity,
}

/// Declaration of one schema field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDef {
    name: Cow<'static, str>,
    ty: FieldType,
    op: MergeOp,
}

impl FieldDef {
    /// Declare a field.
    pub fn new(name: impl Into<Cow<'static, str>>, ty: FieldType, op: MergeOp) -> Self {
        Self {
            name: name.into(),
            ty,
            op,
        }
    }

    /// A summed field.
    pub fn sum(name: impl Into<Cow<'static, str>>, ty: FieldType) -> Self {
        Self::new(name, ty, MergeOp::Sum)
    }

    /// A last-write-wins field.
    pub fn overwrite(name: impl Into<Cow<'static, str>>, ty: FieldType) -> Self {
        Self::new(name, ty, MergeOp::Overwrite)
    }

    /// A field set once at creation.
    pub fn identity(name: impl Into<Cow<'static, str>>, ty: FieldType) -> Self {
        Self::new(name, ty, MergeOp::Identity)
    }

    /// Field name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Field type.
    pub fn ty(&self) -> FieldType {
        self.ty
    }

    /// Merge operation.
    pub fn op(&self) -> MergeOp {
        self.op
    }
}

/// An ordered, validated list of field declarations. Cloning is cheap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeSchema {
    fields: Arc<[FieldDef]>,
}

impl MergeSchema {
    /// Validate and build a schema.
    ///
    /// Fails if the schema is empty, has more than [`MAX_FIELDS`] fields, repeats a
    /// field name, or declares `Sum` on anything other than `long` or `double`.
    pub fn new(fields: impl IntoIterator<Item = FieldDef>) -> Result<Self, ConfigError> {
        let fields: Arc<[FieldDef]> = fields.into_iter().collect();
        if fields.is_empty() {
            return Err(ConfigError::EmptySchema);
        }
        if fields.len() > MAX_FIELDS {
            return Err(ConfigError::TooManyFields(fields.len()));
        }
        let mut seen = HashSet::with_capacity(fields.len());
        for def in fields.iter() {
            if !seen.insert(def.name()) {
                return Err(ConfigError::DuplicateField(def.name().to_owned()));
            }
            if def.op == MergeOp::Sum && !def.ty.is_summable() {
                return Err(ConfigError::SumNotSupported {
                    field: def.name().to_owned(),
                    ty: def.ty,
                });
            }
        }
        Ok(Self { fields })
    }

    /// Field declarations in order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Always false, schemas have at least one field.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of the field called `name`.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|def| def.name() == name)
    }

    /// A fresh record: every field holds its type's zero value and is unset.
    pub fn new_record(&self) -> AggregateRecord {
        AggregateRecord {
            values: self.fields.iter().map(|def| def.ty.zero()).collect(),
            set: 0,
        }
    }

    /// Fold an event's sparse delta into `record`.
    ///
    /// `Identity` fields are only taken if the record doesn't have them yet. The payload
    /// is validated before anything is written, so on error `record` is unchanged.
    pub fn apply(
        &self,
        record: &mut AggregateRecord,
        payload: &[(usize, FieldValue)],
    ) -> Result<(), MergeError> {
        self.check_record(record)?;
        // long sums are the only merge that can fail after validation, so total them up front
        let mut long_sums: SmallVec<[(usize, i64); 4]> = SmallVec::new();
        for (index, value) in payload {
            let def = self.field(*index)?;
            if value.ty() != def.ty {
                return Err(MergeError::TypeMismatch {
                    field: def.name().to_owned(),
                    expected: def.ty,
                    actual: value.ty(),
                });
            }
            if let (MergeOp::Sum, FieldValue::Long(delta)) = (def.op, value) {
                let position = match long_sums.iter().position(|(i, _)| i == index) {
                    Some(position) => position,
                    None => {
                        long_sums.push((*index, record.long(*index).unwrap_or(0)));
                        long_sums.len() - 1
                    }
                };
                let total = &mut long_sums[position].1;
                *total = total
                    .checked_add(*delta)
                    .ok_or_else(|| MergeError::Overflow(def.name().to_owned()))?;
            }
        }

        for (index, value) in payload {
            let index = *index;
            let bit = 1u64 << index;
            match (self.fields[index].op, value) {
                (MergeOp::Sum, FieldValue::Long(_)) => {}
                (MergeOp::Sum, FieldValue::Double(delta)) => {
                    if let FieldValue::Double(current) = &mut record.values[index] {
                        *current += delta;
                    }
                }
                (MergeOp::Identity, _) if record.set & bit != 0 => continue,
                _ => record.values[index] = value.clone(),
            }
            record.set |= bit;
        }
        for (index, total) in long_sums {
            record.values[index] = FieldValue::Long(total);
        }
        Ok(())
    }

    /// Combine an older record with a newer one, field by field.
    ///
    /// Used to reconcile an in-memory delta (`newer`) with the persisted snapshot
    /// (`older`), to fold a failed flush back under deltas that arrived since, and to
    /// roll minute deltas up into coarser buckets. This is a pure function of its inputs.
    ///
    /// | op        | only one set | both set        |
    /// |-----------|--------------|-----------------|
    /// | Sum       | that value   | `older + newer` |
    /// | Overwrite | that value   | `newer`         |
    /// | Identity  | that value   | `older`         |
    pub fn combine(
        &self,
        older: &AggregateRecord,
        newer: &AggregateRecord,
    ) -> Result<AggregateRecord, MergeError> {
        self.check_record(older)?;
        self.check_record(newer)?;
        let mut values = Vec::with_capacity(self.len());
        for (index, def) in self.fields.iter().enumerate() {
            let value = match (older.is_set(index), newer.is_set(index)) {
                (false, false) | (true, false) => older.values[index].clone(),
                (false, true) => newer.values[index].clone(),
                (true, true) => match def.op {
                    MergeOp::Overwrite => newer.values[index].clone(),
                    MergeOp::Identity => older.values[index].clone(),
                    MergeOp::Sum => match (&older.values[index], &newer.values[index]) {
                        (FieldValue::Long(a), FieldValue::Long(b)) => FieldValue::Long(
                            a.checked_add(*b)
                                .ok_or_else(|| MergeError::Overflow(def.name().to_owned()))?,
                        ),
                        (FieldValue::Double(a), FieldValue::Double(b)) => FieldValue::Double(a + b),
                        (_, other) => {
                            return Err(MergeError::TypeMismatch {
                                field: def.name().to_owned(),
                                expected: def.ty,
                                actual: other.ty(),
                            });
                        }
                    },
                },
            };
            values.push(value);
        }
        Ok(AggregateRecord {
            values,
            set: older.set | newer.set,
        })
    }

    fn field(&self, index: usize) -> Result<&FieldDef, MergeError> {
        self.fields.get(index).ok_or(MergeError::FieldOutOfRange {
            index,
            len: self.len(),
        })
    }

    fn check_record(&self, record: &AggregateRecord) -> Result<(), MergeError> {
        if record.len() != self.len() {
            return Err(MergeError::FieldOutOfRange {
                index: record.len(),
                len: self.len(),
            });
        }
        for (def, value) in self.fields.iter().zip(record.values()) {
            if def.ty != value.ty() {
                return Err(MergeError::TypeMismatch {
                    field: def.name().to_owned(),
                    expected: def.ty,
                    actual: value.ty(),
                });
            }
        }
        Ok(())
    }
}
