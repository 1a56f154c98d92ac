//! Bidirectional mapping between logical entity values and persistent
//! records.
//!
//! The store direction turns a JSON entity (or a list of EAV rows) into a
//! [`PersistentRecord`], routing each attribute to its bound main column or
//! to the EAV tail according to the registry. The read direction is the
//! inverse. System-column bindings are ignored on write; those fields are
//! set only by the repository.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use tracing::warn;
use uuid::Uuid;

use crate::error::{LtBaseError, Result};
use crate::layout::{
    self, COL_CREATED_AT, COL_DELETED_AT, COL_ROW_ID, COL_SCHEMA_ID, COL_UPDATED_AT, ColumnKind,
};
use crate::record::{EAVRecord, PersistentRecord};
use crate::schema::{AttributeMetadata, ColumnBinding, Encoding, SchemaAttributes, ValueType};
use crate::util::{ParsedNumber, to_uuid, try_parse_number};

/// A coerced attribute value, already split the way the EAV table stores it.
#[derive(Debug, Clone, PartialEq)]
enum EavValue {
    Text(String),
    Numeric(f64),
}

impl EavValue {
    fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            Self::Text(_) => None,
        }
    }

    fn to_text(&self) -> String {
        match self {
            Self::Text(v) => v.clone(),
            Self::Numeric(v) => format_numeric(*v),
        }
    }
}

/// Format a numeric the way the logical layer expects: integral values
/// without a trailing `.0`.
fn format_numeric(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 9_007_199_254_740_992.0 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

/// Build a record from a logical JSON entity.
///
/// Attribute names missing from the registry are skipped with a warning;
/// null values are treated as absent. Array values produce one EAV row per
/// element with dot-joined `array_indices`.
pub fn record_from_json(
    schema_id: i16,
    row_id: Uuid,
    value: &JsonValue,
    attrs: &SchemaAttributes,
) -> Result<PersistentRecord> {
    let mut record = PersistentRecord::new(schema_id, row_id);

    let Some(object) = value.as_object() else {
        return Ok(record);
    };

    for (attr_name, attr_value) in object {
        let Some(meta) = attrs.get(attr_name) else {
            warn!(attr = %attr_name, "attribute not in registry, skipping");
            continue;
        };
        let mut leaves = Vec::new();
        collect_leaves(attr_value, &mut Vec::new(), &mut leaves);
        for (indices, leaf) in leaves {
            let Some(coerced) = coerce_value(attr_name, meta.value_type, leaf)? else {
                continue;
            };
            append_value(&mut record, attr_name, meta, &indices, coerced)?;
        }
    }

    record.normalize();
    Ok(record)
}

/// Rebuild the full EAV view of a record: the stored EAV tail plus one row
/// per bound attribute whose value is present. System columns are read from
/// the record fields, not from buckets.
pub fn to_eav_rows(record: &PersistentRecord, attrs: &SchemaAttributes) -> Result<Vec<EAVRecord>> {
    let mut rows = record.other_attributes.clone();

    for (_, meta) in attrs.iter() {
        let Some(binding) = &meta.column_binding else {
            continue;
        };
        let Some(value) = read_bound_value(record, binding)? else {
            continue;
        };
        let (value_text, value_numeric) = match value {
            EavValue::Text(v) => (Some(v), None),
            EavValue::Numeric(v) => (None, Some(v)),
        };
        rows.push(EAVRecord {
            schema_id: record.schema_id,
            row_id: record.row_id,
            attr_id: meta.attribute_id,
            array_indices: String::new(),
            value_text,
            value_numeric,
        });
    }

    rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(rows)
}

/// Build a record from a full EAV row list: the inverse of [`to_eav_rows`].
///
/// Rows whose attribute is bound land in the matching bucket; the rest form
/// the EAV tail. An attribute id missing from the cache is fatal — it
/// signals cache drift. Timestamps are left unset; the repository owns them.
pub fn from_eav_rows(
    schema_id: i16,
    row_id: Uuid,
    rows: Vec<EAVRecord>,
    attrs: &SchemaAttributes,
) -> Result<PersistentRecord> {
    let mut record = PersistentRecord::new(schema_id, row_id);

    for row in rows {
        let Some(meta) = attrs.get_by_id(row.attr_id) else {
            return Err(LtBaseError::AttributeCacheMiss {
                schema_id,
                attr_id: row.attr_id,
            });
        };
        let name = attrs.name_of(row.attr_id).unwrap_or_default().to_string();

        if meta.column_binding.is_some() && row.array_indices.is_empty() {
            let value = match (&row.value_text, row.value_numeric) {
                (Some(text), _) => EavValue::Text(text.clone()),
                (None, Some(numeric)) => EavValue::Numeric(numeric),
                (None, None) => continue,
            };
            append_value(&mut record, &name, meta, &[], value)?;
        } else {
            record.other_attributes.push(EAVRecord {
                schema_id,
                row_id,
                ..row
            });
        }
    }

    record.normalize();
    Ok(record)
}

/// Reassemble the logical JSON entity from a record.
pub fn json_from_record(
    record: &PersistentRecord,
    attrs: &SchemaAttributes,
) -> Result<JsonValue> {
    let rows = to_eav_rows(record, attrs)?;

    // Group rows per attribute, keeping element paths for array rebuilds.
    let mut grouped: BTreeMap<i16, Vec<(Vec<usize>, JsonValue)>> = BTreeMap::new();
    for row in &rows {
        let Some(meta) = attrs.get_by_id(row.attr_id) else {
            return Err(LtBaseError::AttributeCacheMiss {
                schema_id: record.schema_id,
                attr_id: row.attr_id,
            });
        };
        let json = eav_row_to_json(row, meta.value_type);
        grouped
            .entry(row.attr_id)
            .or_default()
            .push((parse_indices(&row.array_indices), json));
    }

    let mut object = serde_json::Map::new();
    for (attr_id, entries) in grouped {
        let Some(name) = attrs.name_of(attr_id) else {
            continue;
        };
        object.insert(name.to_string(), assemble_entries(entries));
    }
    Ok(JsonValue::Object(object))
}

/// Flatten a JSON value into `(array_indices, leaf)` pairs.
fn collect_leaves<'a>(
    value: &'a JsonValue,
    path: &mut Vec<usize>,
    out: &mut Vec<(Vec<usize>, &'a JsonValue)>,
) {
    match value {
        JsonValue::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                path.push(idx);
                collect_leaves(item, path, out);
                path.pop();
            }
        }
        other => out.push((path.clone(), other)),
    }
}

/// Coerce one JSON leaf to the attribute's value type. `None` means the
/// value is absent (JSON null).
fn coerce_value(
    attr: &str,
    value_type: ValueType,
    value: &JsonValue,
) -> Result<Option<EavValue>> {
    if value.is_null() {
        return Ok(None);
    }

    let invalid = || LtBaseError::InvalidAttributeValue {
        attr: attr.to_string(),
        value: value.to_string(),
    };

    let coerced = match value_type {
        ValueType::Text => EavValue::Text(match value {
            JsonValue::String(s) => s.clone(),
            JsonValue::Bool(b) => b.to_string(),
            JsonValue::Number(n) => n.to_string(),
            other => other.to_string(),
        }),
        ValueType::Uuid => {
            let s = value.as_str().ok_or_else(invalid)?;
            EavValue::Text(to_uuid(s)?.to_string())
        }
        ValueType::Numeric | ValueType::Smallint | ValueType::Integer | ValueType::Bigint => {
            let numeric = match value {
                JsonValue::Number(n) => n.as_f64().ok_or_else(invalid)?,
                JsonValue::String(s) => match try_parse_number(s) {
                    Some(ParsedNumber::Int(i)) => i as f64,
                    Some(ParsedNumber::Float(f)) => f,
                    None => return Err(invalid()),
                },
                _ => return Err(invalid()),
            };
            EavValue::Numeric(numeric)
        }
        ValueType::Bool => {
            let numeric = match value {
                JsonValue::Bool(b) => f64::from(u8::from(*b)),
                JsonValue::Number(n) => n.as_f64().ok_or_else(invalid)?,
                JsonValue::String(s) => match s.as_str() {
                    "true" | "1" => 1.0,
                    "false" | "0" => 0.0,
                    _ => return Err(invalid()),
                },
                _ => return Err(invalid()),
            };
            EavValue::Numeric(numeric)
        }
        ValueType::Date | ValueType::Datetime => {
            let ms = match value {
                JsonValue::Number(n) => n.as_i64().ok_or_else(invalid)?,
                JsonValue::String(s) => {
                    parse_date_literal(s).ok_or_else(|| LtBaseError::InvalidDateLiteral {
                        attr: attr.to_string(),
                        literal: s.clone(),
                    })?
                }
                _ => return Err(invalid()),
            };
            EavValue::Numeric(ms as f64)
        }
    };
    Ok(Some(coerced))
}

/// Route a coerced value either into its bound main column or into the EAV
/// tail.
fn append_value(
    record: &mut PersistentRecord,
    attr_name: &str,
    meta: &AttributeMetadata,
    indices: &[usize],
    value: EavValue,
) -> Result<()> {
    let bound_scalar = meta.column_binding.as_ref().filter(|_| indices.is_empty());

    if let Some(binding) = bound_scalar {
        return store_bound_value(record, attr_name, binding, &value);
    }

    let (value_text, value_numeric) = match value {
        EavValue::Text(v) => (Some(v), None),
        EavValue::Numeric(v) => (None, Some(v)),
    };
    record.other_attributes.push(EAVRecord {
        schema_id: record.schema_id,
        row_id: record.row_id,
        attr_id: meta.attribute_id,
        array_indices: join_indices(indices),
        value_text,
        value_numeric,
    });
    Ok(())
}

/// Store a coerced value into its bound main column per the encoding rules.
fn store_bound_value(
    record: &mut PersistentRecord,
    attr_name: &str,
    binding: &ColumnBinding,
    value: &EavValue,
) -> Result<()> {
    let col = binding.column_name.as_str();
    let Some(descriptor) = layout::descriptor(col) else {
        return Err(LtBaseError::UnknownMainColumn {
            column: col.to_string(),
        });
    };

    // System fields are set only by the repository.
    if descriptor.kind == ColumnKind::System {
        return Ok(());
    }

    let numeric = || {
        value.as_numeric().ok_or_else(|| LtBaseError::InvalidAttributeValue {
            attr: attr_name.to_string(),
            value: value.to_text(),
        })
    };

    match binding.encoding {
        Encoding::UnixMs => {
            record.int64.insert(col.to_string(), numeric()? as i64);
        }
        Encoding::BoolInt => {
            record
                .int16
                .insert(col.to_string(), i16::from(numeric()? > 0.5));
        }
        Encoding::BoolText => {
            let flag = if numeric()? > 0.5 { "1" } else { "0" };
            record.text.insert(col.to_string(), flag.to_string());
        }
        Encoding::Iso8601 => {
            record
                .text
                .insert(col.to_string(), format_iso8601(numeric()? as i64));
        }
        Encoding::Default => match descriptor.kind {
            ColumnKind::Text => {
                record.text.insert(col.to_string(), value.to_text());
            }
            ColumnKind::SmallInt => {
                record.int16.insert(col.to_string(), numeric()? as i16);
            }
            ColumnKind::Integer => {
                record.int32.insert(col.to_string(), numeric()? as i32);
            }
            ColumnKind::BigInt => {
                record.int64.insert(col.to_string(), numeric()? as i64);
            }
            ColumnKind::Double => {
                record.float64.insert(col.to_string(), numeric()?);
            }
            ColumnKind::Uuid => {
                let id = to_uuid(&value.to_text())?;
                record.uuid.insert(col.to_string(), id);
            }
            ColumnKind::System => {}
        },
    }
    Ok(())
}

/// Read the value of a bound attribute back out of a record. `None` means
/// the column is NULL and the attribute yields no EAV entry.
fn read_bound_value(
    record: &PersistentRecord,
    binding: &ColumnBinding,
) -> Result<Option<EavValue>> {
    let col = binding.column_name.as_str();

    // System columns come from the record fields, not the buckets.
    match col {
        COL_SCHEMA_ID => return Ok(Some(EavValue::Numeric(f64::from(record.schema_id)))),
        COL_ROW_ID => return Ok(Some(EavValue::Text(record.row_id.to_string()))),
        COL_CREATED_AT => return Ok(Some(EavValue::Numeric(record.created_at as f64))),
        COL_UPDATED_AT => return Ok(Some(EavValue::Numeric(record.updated_at as f64))),
        COL_DELETED_AT => {
            return Ok(record.deleted_at.map(|ms| EavValue::Numeric(ms as f64)));
        }
        _ => {}
    }

    let Some(descriptor) = layout::descriptor(col) else {
        return Err(LtBaseError::UnknownMainColumn {
            column: col.to_string(),
        });
    };

    let value = match binding.encoding {
        Encoding::UnixMs => record
            .int64
            .get(col)
            .map(|v| EavValue::Numeric(*v as f64)),
        Encoding::BoolInt => record
            .int16
            .get(col)
            .map(|v| EavValue::Numeric(f64::from(u8::from(*v > 0)))),
        Encoding::BoolText => record
            .text
            .get(col)
            .map(|v| EavValue::Numeric(f64::from(u8::from(v == "1")))),
        Encoding::Iso8601 => match record.text.get(col) {
            Some(text) => {
                let ms = DateTime::parse_from_rfc3339(text)
                    .map_err(|_| LtBaseError::InvalidTimestamp {
                        column: col.to_string(),
                        value: text.clone(),
                    })?
                    .timestamp_millis();
                Some(EavValue::Numeric(ms as f64))
            }
            None => None,
        },
        Encoding::Default => match descriptor.kind {
            ColumnKind::Text => record.text.get(col).map(|v| EavValue::Text(v.clone())),
            ColumnKind::SmallInt => record
                .int16
                .get(col)
                .map(|v| EavValue::Numeric(f64::from(*v))),
            ColumnKind::Integer => record
                .int32
                .get(col)
                .map(|v| EavValue::Numeric(f64::from(*v))),
            ColumnKind::BigInt => record
                .int64
                .get(col)
                .map(|v| EavValue::Numeric(*v as f64)),
            ColumnKind::Double => record.float64.get(col).map(|v| EavValue::Numeric(*v)),
            ColumnKind::Uuid => record
                .uuid
                .get(col)
                .map(|v| EavValue::Text(v.to_string())),
            ColumnKind::System => None,
        },
    };

    Ok(value)
}

fn eav_row_to_json(row: &EAVRecord, value_type: ValueType) -> JsonValue {
    match value_type {
        ValueType::Text | ValueType::Uuid => row
            .value_text
            .clone()
            .map_or(JsonValue::Null, JsonValue::String),
        ValueType::Bool => row
            .value_numeric
            .map_or(JsonValue::Null, |v| JsonValue::Bool(v > 0.5)),
        ValueType::Date | ValueType::Datetime | ValueType::Smallint | ValueType::Integer
        | ValueType::Bigint => row
            .value_numeric
            .map_or(JsonValue::Null, |v| JsonValue::from(v as i64)),
        ValueType::Numeric => row.value_numeric.map_or(JsonValue::Null, |v| {
            serde_json::Number::from_f64(v).map_or(JsonValue::Null, JsonValue::Number)
        }),
    }
}

fn join_indices(indices: &[usize]) -> String {
    indices
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

fn parse_indices(indices: &str) -> Vec<usize> {
    if indices.is_empty() {
        return Vec::new();
    }
    indices
        .split('.')
        .filter_map(|part| part.parse().ok())
        .collect()
}

/// Rebuild a scalar or (possibly nested) array from indexed entries.
fn assemble_entries(mut entries: Vec<(Vec<usize>, JsonValue)>) -> JsonValue {
    if entries.len() == 1 && entries[0].0.is_empty() {
        return entries.remove(0).1;
    }

    let mut groups: BTreeMap<usize, Vec<(Vec<usize>, JsonValue)>> = BTreeMap::new();
    for (mut path, value) in entries {
        if path.is_empty() {
            // Mixed scalar/array rows should not occur; prefer the scalar.
            return value;
        }
        let head = path.remove(0);
        groups.entry(head).or_default().push((path, value));
    }
    JsonValue::Array(groups.into_values().map(assemble_entries).collect())
}

/// Parse a date literal: RFC3339 or Unix milliseconds.
#[must_use]
pub fn parse_date_literal(s: &str) -> Option<i64> {
    let trimmed = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp_millis());
    }
    trimmed.parse::<i64>().ok()
}

/// Format Unix milliseconds as UTC RFC3339 with millisecond precision.
#[must_use]
pub fn format_iso8601(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::schema::{AttributeMetadata, ColumnBinding, Encoding, ValueType};

    fn attr(
        id: i16,
        value_type: ValueType,
        binding: Option<(&str, Encoding)>,
    ) -> AttributeMetadata {
        AttributeMetadata {
            attribute_id: id,
            value_type,
            column_binding: binding.map(|(col, encoding)| ColumnBinding {
                column_name: col.to_string(),
                encoding,
            }),
        }
    }

    fn visit_attrs() -> SchemaAttributes {
        let mut map = HashMap::new();
        map.insert(
            "status".to_string(),
            attr(1, ValueType::Text, Some(("text_01", Encoding::Default))),
        );
        map.insert(
            "lead_id".to_string(),
            attr(2, ValueType::Uuid, Some(("uuid_01", Encoding::Default))),
        );
        map.insert(
            "visited_at".to_string(),
            attr(3, ValueType::Datetime, Some(("bigint_01", Encoding::UnixMs))),
        );
        map.insert(
            "confirmed".to_string(),
            attr(4, ValueType::Bool, Some(("smallint_01", Encoding::BoolInt))),
        );
        map.insert(
            "scheduled_for".to_string(),
            attr(5, ValueType::Datetime, Some(("text_02", Encoding::Iso8601))),
        );
        map.insert("feedback".to_string(), attr(6, ValueType::Text, None));
        map.insert("scores".to_string(), attr(7, ValueType::Numeric, None));
        SchemaAttributes::new(map)
    }

    #[test]
    fn json_routes_values_across_the_boundary() {
        let attrs = visit_attrs();
        let lead = Uuid::new_v4();
        let row_id = Uuid::new_v4();
        let entity = serde_json::json!({
            "status": "scheduled",
            "lead_id": lead.to_string(),
            "visited_at": 1_700_000_000_000i64,
            "confirmed": true,
            "scheduled_for": "2024-03-01T10:00:00Z",
            "feedback": "initial",
            "scores": [1.5, 2.5],
        });

        let record = record_from_json(9, row_id, &entity, &attrs).unwrap();

        assert_eq!(record.text["text_01"], "scheduled");
        assert_eq!(record.uuid["uuid_01"], lead);
        assert_eq!(record.int64["bigint_01"], 1_700_000_000_000);
        assert_eq!(record.int16["smallint_01"], 1);
        assert_eq!(record.text["text_02"], "2024-03-01T10:00:00.000Z");

        // feedback (scalar) + scores (two elements) stay in the EAV tail
        assert_eq!(record.other_attributes.len(), 3);
        let scores: Vec<&EAVRecord> = record
            .other_attributes
            .iter()
            .filter(|e| e.attr_id == 7)
            .collect();
        assert_eq!(scores[0].array_indices, "0");
        assert_eq!(scores[0].value_numeric, Some(1.5));
        assert_eq!(scores[1].array_indices, "1");
    }

    #[test]
    fn unknown_attribute_is_skipped() {
        let attrs = visit_attrs();
        let entity = serde_json::json!({"status": "ok", "mystery": 1});
        let record = record_from_json(9, Uuid::new_v4(), &entity, &attrs).unwrap();
        assert_eq!(record.text["text_01"], "ok");
        assert!(record.other_attributes.is_empty());
    }

    #[test]
    fn unknown_bound_column_fails_before_sql() {
        let mut map = HashMap::new();
        map.insert(
            "broken".to_string(),
            attr(1, ValueType::Text, Some(("text_99", Encoding::Default))),
        );
        let attrs = SchemaAttributes::new(map);
        let err = record_from_json(
            1,
            Uuid::new_v4(),
            &serde_json::json!({"broken": "x"}),
            &attrs,
        )
        .unwrap_err();
        assert!(matches!(err, LtBaseError::UnknownMainColumn { .. }));
    }

    #[test]
    fn eav_round_trip_preserves_record() {
        let attrs = visit_attrs();
        let row_id = Uuid::new_v4();
        let entity = serde_json::json!({
            "status": "visited",
            "visited_at": 1_700_000_123_456i64,
            "confirmed": false,
            "feedback": "updated",
            "scores": [3.0],
        });
        let mut record = record_from_json(9, row_id, &entity, &attrs).unwrap();
        record.normalize();

        let rows = to_eav_rows(&record, &attrs).unwrap();
        let mut rebuilt = from_eav_rows(9, row_id, rows, &attrs).unwrap();
        rebuilt.normalize();

        // Timestamps are repository-owned; everything else must survive.
        rebuilt.created_at = record.created_at;
        rebuilt.updated_at = record.updated_at;
        assert_eq!(rebuilt, record);
    }

    #[test]
    fn iso8601_parse_failure_is_fatal() {
        let attrs = visit_attrs();
        let mut record = PersistentRecord::new(9, Uuid::new_v4());
        record
            .text
            .insert("text_02".to_string(), "not-a-timestamp".to_string());
        let err = to_eav_rows(&record, &attrs).unwrap_err();
        assert!(matches!(err, LtBaseError::InvalidTimestamp { .. }));
    }

    #[test]
    fn cache_drift_is_fatal() {
        let attrs = visit_attrs();
        let row_id = Uuid::new_v4();
        let rows = vec![EAVRecord {
            schema_id: 9,
            row_id,
            attr_id: 99,
            array_indices: String::new(),
            value_text: Some("x".to_string()),
            value_numeric: None,
        }];
        let err = from_eav_rows(9, row_id, rows, &attrs).unwrap_err();
        assert!(matches!(err, LtBaseError::AttributeCacheMiss { attr_id: 99, .. }));
    }

    #[test]
    fn json_view_rebuilds_arrays_and_bound_values() {
        let attrs = visit_attrs();
        let row_id = Uuid::new_v4();
        let entity = serde_json::json!({
            "status": "visited",
            "confirmed": true,
            "scores": [1.5, 2.5],
        });
        let mut record = record_from_json(9, row_id, &entity, &attrs).unwrap();
        record.created_at = 100;
        record.updated_at = 200;

        let json = json_from_record(&record, &attrs).unwrap();
        assert_eq!(json["status"], "visited");
        assert_eq!(json["confirmed"], true);
        assert_eq!(json["scores"], serde_json::json!([1.5, 2.5]));
    }

    #[test]
    fn bool_text_and_date_literals() {
        let mut map = HashMap::new();
        map.insert(
            "active".to_string(),
            attr(1, ValueType::Bool, Some(("text_03", Encoding::BoolText))),
        );
        let attrs = SchemaAttributes::new(map);
        let record = record_from_json(
            1,
            Uuid::new_v4(),
            &serde_json::json!({"active": true}),
            &attrs,
        )
        .unwrap();
        assert_eq!(record.text["text_03"], "1");

        assert_eq!(
            parse_date_literal("2024-03-01T10:00:00Z"),
            Some(1_709_287_200_000)
        );
        assert_eq!(parse_date_literal("1700000000000"), Some(1_700_000_000_000));
        assert_eq!(parse_date_literal("next tuesday"), None);
    }
}
