// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Positional remote-data schema.
//!
//! A record crosses the wire as six typed lists. Each field of a kind's merge schema owns
//! one slot in the list for its type, in field order, so both ends must agree on the
//! schema of every kind id. The encoding is not self-describing.

use std::collections::HashMap;

use tally_core::{AggregateRecord, FieldType, FieldValue, KindId, MergeSchema};

use crate::CodecError;

/// Field values of one record, split into typed lists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteData {
    pub strings: Vec<String>,
    pub ints: Vec<i32>,
    pub longs: Vec<i64>,
    pub doubles: Vec<f64>,
    pub bools: Vec<bool>,
    pub bytes: Vec<Vec<u8>>,
}

impl RemoteData {
    fn len_of(&self, ty: FieldType) -> usize {
        match ty {
            FieldType::Str => self.strings.len(),
            FieldType::Int => self.ints.len(),
            FieldType::Long => self.longs.len(),
            FieldType::Double => self.doubles.len(),
            FieldType::Bool => self.bools.len(),
            FieldType::Bytes => self.bytes.len(),
        }
    }
}

/// Slot layout for one kind.
#[derive(Clone, Debug)]
pub struct RemoteSchema {
    schema: MergeSchema,
    // (type, position in that type's list), per field
    slots: Vec<(FieldType, usize)>,
    counts: [usize; 6],
}

const TYPES: [FieldType; 6] = [
    FieldType::Str,
    FieldType::Int,
    FieldType::Long,
    FieldType::Double,
    FieldType::Bool,
    FieldType::Bytes,
];

fn list_index(ty: FieldType) -> usize {
    match ty {
        FieldType::Str => 0,
        FieldType::Int => 1,
        FieldType::Long => 2,
        FieldType::Double => 3,
        FieldType::Bool => 4,
        FieldType::Bytes => 5,
    }
}

impl RemoteSchema {
    pub fn new(schema: MergeSchema) -> Self {
        let mut counts = [0usize; 6];
        let slots = schema
            .fields()
            .iter()
            .map(|def| {
                let list = &mut counts[list_index(def.ty())];
                *list += 1;
                (def.ty(), *list - 1)
            })
            .collect();
        Self {
            schema,
            slots,
            counts,
        }
    }

    pub fn merge_schema(&self) -> &MergeSchema {
        &self.schema
    }

    /// Split `record` into typed lists.
    pub fn encode(&self, record: &AggregateRecord) -> Result<RemoteData, CodecError> {
        if record.len() != self.slots.len() {
            return Err(CodecError::FieldCount {
                expected: self.slots.len(),
                actual: record.len(),
            });
        }
        let mut data = RemoteData::default();
        for (index, value) in record.values().iter().enumerate() {
            let expected = self.slots[index].0;
            match value {
                FieldValue::Str(v) if expected == FieldType::Str => data.strings.push(v.clone()),
                FieldValue::Int(v) if expected == FieldType::Int => data.ints.push(*v),
                FieldValue::Long(v) if expected == FieldType::Long => data.longs.push(*v),
                FieldValue::Double(v) if expected == FieldType::Double => data.doubles.push(*v),
                FieldValue::Bool(v) if expected == FieldType::Bool => data.bools.push(*v),
                FieldValue::Bytes(v) if expected == FieldType::Bytes => data.bytes.push(v.clone()),
                other => {
                    return Err(CodecError::SlotType {
                        index,
                        expected,
                        actual: other.ty(),
                    });
                }
            }
        }
        Ok(data)
    }

    /// Reassemble field values from typed lists. Every list must have exactly the length
    /// the schema implies.
    pub fn decode(&self, data: &RemoteData) -> Result<Vec<FieldValue>, CodecError> {
        for ty in TYPES {
            let (expected, actual) = (self.counts[list_index(ty)], data.len_of(ty));
            if expected != actual {
                return Err(CodecError::ListLength {
                    list: ty,
                    expected,
                    actual,
                });
            }
        }
        Ok(self
            .slots
            .iter()
            .map(|&(ty, slot)| match ty {
                FieldType::Str => FieldValue::Str(data.strings[slot].clone()),
                FieldType::Int => FieldValue::Int(data.ints[slot]),
                FieldType::Long => FieldValue::Long(data.longs[slot]),
                FieldType::Double => FieldValue::Double(data.doubles[slot]),
                FieldType::Bool => FieldValue::Bool(data.bools[slot]),
                FieldType::Bytes => FieldValue::Bytes(data.bytes[slot].clone()),
            })
            .collect())
    }
}

/// Remote schemas by kind id. Both ends of a connection must be built from the same table.
#[derive(Clone, Debug, Default)]
pub struct RemoteSchemas {
    kinds: HashMap<KindId, RemoteSchema>,
}

impl RemoteSchemas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: KindId, schema: MergeSchema) -> Self {
        self.kinds.insert(kind, RemoteSchema::new(schema));
        self
    }

    pub fn get(&self, kind: KindId) -> Result<&RemoteSchema, CodecError> {
        self.kinds.get(&kind).ok_or(CodecError::UnknownKind(kind))
    }
}

impl FromIterator<(KindId, MergeSchema)> for RemoteSchemas {
    fn from_iter<I: IntoIterator<Item = (KindId, MergeSchema)>>(iter: I) -> Self {
        Self {
            kinds: iter
                .into_iter()
                .map(|(kind, schema)| (kind, RemoteSchema::new(schema)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert2::check;
    use tally_core::FieldDef;

    use super::*;

    fn schema() -> RemoteSchema {
        RemoteSchema::new(
            MergeSchema::new([
                FieldDef::identity("name", FieldType::Str),
                FieldDef::sum("calls", FieldType::Long),
                FieldDef::overwrite("layer", FieldType::Str),
                FieldDef::sum("latency", FieldType::Double),
                FieldDef::overwrite("status", FieldType::Bool),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn fields_fill_typed_lists_in_order() {
        let schema = schema();
        let record = AggregateRecord::from_values(
            schema.merge_schema(),
            vec![
                "svc".into(),
                3i64.into(),
                "http".into(),
                1.5.into(),
                true.into(),
            ],
        )
        .unwrap();
        let data = schema.encode(&record).unwrap();
        check!(data.strings == vec!["svc".to_owned(), "http".to_owned()]);
        check!(data.longs == vec![3]);
        check!(data.doubles == vec![1.5]);
        check!(data.bools == vec![true]);
        check!(data.ints.is_empty());
        check!(schema.decode(&data).unwrap() == record.values());
    }

    #[test]
    fn decode_is_strict_about_list_lengths() {
        let schema = schema();
        let data = RemoteData {
            strings: vec!["svc".into()],
            longs: vec![3],
            doubles: vec![1.5],
            bools: vec![true],
            ..RemoteData::default()
        };
        check!(
            schema.decode(&data)
                == Err(CodecError::ListLength {
                    list: FieldType::Str,
                    expected: 2,
                    actual: 1,
                })
        );

        let data = RemoteData {
            strings: vec!["svc".into(), "http".into()],
            ints: vec![3],
            doubles: vec![1.5],
            bools: vec![true],
            ..RemoteData::default()
        };
        check!(
            schema.decode(&data)
                == Err(CodecError::ListLength {
                    list: FieldType::Int,
                    expected: 0,
                    actual: 1,
                })
        );
    }
}
