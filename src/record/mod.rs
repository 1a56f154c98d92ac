//! Persistent record model.
//!
//! A [`PersistentRecord`] is one entity instance materialized from storage:
//! system fields, kind-bucketed main-column maps, and the open-ended EAV
//! tail. Records have the same shape regardless of which tier produced them.

pub mod transform;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LtBaseError, Result};
use crate::layout::{self, ColumnKind};

/// One row of the EAV table.
///
/// `array_indices` is empty for scalars and dot-joined element indices for
/// array values. Exactly one of `value_text` / `value_numeric` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EAVRecord {
    pub schema_id: i16,
    pub row_id: Uuid,
    pub attr_id: i16,
    #[serde(default)]
    pub array_indices: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_numeric: Option<f64>,
}

impl EAVRecord {
    /// Sort key matching the EAV primary key tail.
    #[must_use]
    pub fn sort_key(&self) -> (i16, &str) {
        (self.attr_id, self.array_indices.as_str())
    }
}

/// A single entity instance as stored.
///
/// Bucket maps are keyed by fixed column name (`text_01`, `smallint_02`, …);
/// a missing key means NULL. `BTreeMap` keeps column names sorted, which
/// pins statement argument positions on the write path.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PersistentRecord {
    pub schema_id: i16,
    pub row_id: Uuid,
    /// Unix milliseconds; preserved across updates.
    pub created_at: i64,
    /// Unix milliseconds; monotone-nondecreasing.
    pub updated_at: i64,
    /// Set only on tombstone.
    pub deleted_at: Option<i64>,
    pub text: BTreeMap<String, String>,
    pub int16: BTreeMap<String, i16>,
    pub int32: BTreeMap<String, i32>,
    pub int64: BTreeMap<String, i64>,
    pub float64: BTreeMap<String, f64>,
    pub uuid: BTreeMap<String, Uuid>,
    pub other_attributes: Vec<EAVRecord>,
}

impl PersistentRecord {
    #[must_use]
    pub fn new(schema_id: i16, row_id: Uuid) -> Self {
        Self {
            schema_id,
            row_id,
            ..Self::default()
        }
    }

    /// Whether every bucket is empty and no EAV rows are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
            && self.int16.is_empty()
            && self.int32.is_empty()
            && self.int64.is_empty()
            && self.float64.is_empty()
            && self.uuid.is_empty()
            && self.other_attributes.is_empty()
    }

    /// Sort the EAV tail by `(attr_id, array_indices)` for order-insensitive
    /// comparisons.
    pub fn normalize(&mut self) {
        self.other_attributes
            .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }

    /// Flatten the bucket maps into `(column, value)` pairs in sorted
    /// column-name order, validating every key against the catalog. Fails
    /// before any SQL is issued when a key is unknown or lands in the wrong
    /// bucket.
    pub fn bucket_columns(&self) -> Result<Vec<(String, ScalarValue)>> {
        fn check(name: &str, expected: ColumnKind) -> Result<()> {
            match layout::descriptor(name) {
                None => Err(LtBaseError::UnknownMainColumn {
                    column: name.to_string(),
                }),
                Some(d) if d.kind != expected => Err(LtBaseError::MainColumnKindMismatch {
                    column: name.to_string(),
                    kind: expected.as_str(),
                }),
                Some(_) => Ok(()),
            }
        }

        let mut out = Vec::new();
        for (name, value) in &self.text {
            check(name, ColumnKind::Text)?;
            out.push((name.clone(), ScalarValue::Text(value.clone())));
        }
        for (name, value) in &self.int16 {
            check(name, ColumnKind::SmallInt)?;
            out.push((name.clone(), ScalarValue::SmallInt(*value)));
        }
        for (name, value) in &self.int32 {
            check(name, ColumnKind::Integer)?;
            out.push((name.clone(), ScalarValue::Int(*value)));
        }
        for (name, value) in &self.int64 {
            check(name, ColumnKind::BigInt)?;
            out.push((name.clone(), ScalarValue::BigInt(*value)));
        }
        for (name, value) in &self.float64 {
            check(name, ColumnKind::Double)?;
            out.push((name.clone(), ScalarValue::Double(*value)));
        }
        for (name, value) in &self.uuid {
            check(name, ColumnKind::Uuid)?;
            out.push((name.clone(), ScalarValue::Uuid(*value)));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

/// An owned SQL scalar, bindable to either tier.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Text(String),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Double(f64),
    Uuid(Uuid),
    Bool(bool),
}

impl ScalarValue {
    /// Box the value as a hot-tier statement parameter.
    #[must_use]
    pub fn to_pg(&self) -> Box<dyn tokio_postgres::types::ToSql + Sync + Send> {
        match self {
            Self::Text(v) => Box::new(v.clone()),
            Self::SmallInt(v) => Box::new(*v),
            Self::Int(v) => Box::new(*v),
            Self::BigInt(v) => Box::new(*v),
            Self::Double(v) => Box::new(*v),
            Self::Uuid(v) => Box::new(*v),
            Self::Bool(v) => Box::new(*v),
        }
    }

    /// Convert to an owned cold-tier value. UUIDs travel as text and are
    /// cast back in SQL.
    #[must_use]
    pub fn to_duck(&self) -> duckdb::types::Value {
        use duckdb::types::Value;
        match self {
            Self::Text(v) => Value::Text(v.clone()),
            Self::SmallInt(v) => Value::SmallInt(*v),
            Self::Int(v) => Value::Int(*v),
            Self::BigInt(v) => Value::BigInt(*v),
            Self::Double(v) => Value::Double(*v),
            Self::Uuid(v) => Value::Text(v.to_string()),
            Self::Bool(v) => Value::Boolean(*v),
        }
    }
}

impl std::fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(v) => write!(f, "{v}"),
            Self::SmallInt(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Uuid(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}
