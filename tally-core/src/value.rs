// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed field values.

use std::fmt;

/// A single field of an aggregate record or event payload.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    /// UTF-8 string, typically a label or natural key.
    Str(String),
    /// 32-bit integer. Not summable, use [`FieldValue::Long`] for counters.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 64-bit IEEE-754 float.
    Double(f64),
    /// Boolean flag.
    Bool(bool),
    /// Opaque byte blob.
    Bytes(Vec<u8>),
}

/// Type tag of a [`FieldValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FieldType {
    /// See [`FieldValue::Str`].
    Str,
    /// See [`FieldValue::Int`].
    Int,
    /// See [`FieldValue::Long`].
    Long,
    /// See [`FieldValue::Double`].
    Double,
    /// See [`FieldValue::Bool`].
    Bool,
    /// See [`FieldValue::Bytes`].
    Bytes,
}

impl FieldType {
    /// The value a freshly created record holds for a field of this type.
    pub fn zero(self) -> FieldValue {
        match self {
            FieldType::Str => FieldValue::Str(String::new()),
            FieldType::Int => FieldValue::Int(0),
            FieldType::Long => FieldValue::Long(0),
            FieldType::Double => FieldValue::Double(0.0),
            FieldType::Bool => FieldValue::Bool(false),
            FieldType::Bytes => FieldValue::Bytes(Vec::new()),
        }
    }

    /// Whether `Sum` is defined for this type.
    pub fn is_summable(self) -> bool {
        matches!(self, FieldType::Long | FieldType::Double)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldType::Str => "string",
            FieldType::Int => "int",
            FieldType::Long => "long",
            FieldType::Double => "double",
            FieldType::Bool => "bool",
            FieldType::Bytes => "bytes",
        })
    }
}

impl FieldValue {
    /// Type tag of this value.
    pub fn ty(&self) -> FieldType {
        match self {
            FieldValue::Str(_) => FieldType::Str,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Long(_) => FieldType::Long,
            FieldValue::Double(_) => FieldType::Double,
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Bytes(_) => FieldType::Bytes,
        }
    }

    /// The value as a long, if it is one.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a double, if it is one.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(value: $ty) -> Self {
                    FieldValue::$variant(value.into())
                }
            }
        )*
    };
}

impl_from! {
    String => Str,
    &str => Str,
    i32 => Int,
    i64 => Long,
    f64 => Double,
    bool => Bool,
    Vec<u8> => Bytes,
    &[u8] => Bytes,
}
