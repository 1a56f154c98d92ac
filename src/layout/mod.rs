//! Fixed main-table column catalog.
//!
//! The catalog is a process-wide compile-time constant. Reshaping it at
//! runtime would break the record equality invariants the transformer
//! relies on; a deployment that needs a different shape regenerates this
//! module per build.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// System column: schema id (smallint, part of the primary key).
pub const COL_SCHEMA_ID: &str = "ltbase_schema_id";
/// System column: row id (uuid, part of the primary key).
pub const COL_ROW_ID: &str = "ltbase_row_id";
/// System column: creation time, Unix milliseconds.
pub const COL_CREATED_AT: &str = "ltbase_created_at";
/// System column: last update time, Unix milliseconds.
pub const COL_UPDATED_AT: &str = "ltbase_updated_at";
/// System column: tombstone time, Unix milliseconds, nullable.
pub const COL_DELETED_AT: &str = "ltbase_deleted_at";

/// System columns in projection order.
pub const SYSTEM_COLUMNS: &[&str] = &[
    COL_SCHEMA_ID,
    COL_ROW_ID,
    COL_CREATED_AT,
    COL_UPDATED_AT,
    COL_DELETED_AT,
];

pub const TEXT_COLUMNS: &[&str] = &[
    "text_01", "text_02", "text_03", "text_04", "text_05", "text_06", "text_07", "text_08",
    "text_09", "text_10",
];

pub const SMALLINT_COLUMNS: &[&str] = &["smallint_01", "smallint_02", "smallint_03"];

pub const INTEGER_COLUMNS: &[&str] = &["integer_01", "integer_02", "integer_03"];

pub const BIGINT_COLUMNS: &[&str] = &["bigint_01", "bigint_02", "bigint_03"];

pub const DOUBLE_COLUMNS: &[&str] = &["double_01", "double_02", "double_03"];

pub const UUID_COLUMNS: &[&str] = &["uuid_01", "uuid_02"];

/// Storage kind of a main-table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    System,
    Text,
    SmallInt,
    Integer,
    BigInt,
    Double,
    Uuid,
}

impl ColumnKind {
    /// Human-readable kind name used in error messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Text => "text",
            Self::SmallInt => "smallint",
            Self::Integer => "integer",
            Self::BigInt => "bigint",
            Self::Double => "double",
            Self::Uuid => "uuid",
        }
    }
}

/// Descriptor of one catalog column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub kind: ColumnKind,
    pub name: &'static str,
}

static CATALOG: Lazy<HashMap<&'static str, ColumnDescriptor>> = Lazy::new(|| {
    let mut map = HashMap::new();
    let groups: &[(ColumnKind, &[&'static str])] = &[
        (ColumnKind::System, SYSTEM_COLUMNS),
        (ColumnKind::Text, TEXT_COLUMNS),
        (ColumnKind::SmallInt, SMALLINT_COLUMNS),
        (ColumnKind::Integer, INTEGER_COLUMNS),
        (ColumnKind::BigInt, BIGINT_COLUMNS),
        (ColumnKind::Double, DOUBLE_COLUMNS),
        (ColumnKind::Uuid, UUID_COLUMNS),
    ];
    for (kind, names) in groups {
        for name in *names {
            map.insert(*name, ColumnDescriptor { kind: *kind, name });
        }
    }
    map
});

/// All columns in projection order: system columns first, then the typed
/// slots in declaration order.
pub static PROJECTION_COLUMNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    let mut cols = Vec::new();
    cols.extend_from_slice(SYSTEM_COLUMNS);
    cols.extend_from_slice(TEXT_COLUMNS);
    cols.extend_from_slice(SMALLINT_COLUMNS);
    cols.extend_from_slice(INTEGER_COLUMNS);
    cols.extend_from_slice(BIGINT_COLUMNS);
    cols.extend_from_slice(DOUBLE_COLUMNS);
    cols.extend_from_slice(UUID_COLUMNS);
    cols
});

static PROJECTION_SQL: Lazy<String> = Lazy::new(|| PROJECTION_COLUMNS.join(", "));

/// Whether `name` is a catalog column (slot or system).
#[must_use]
pub fn is_main_column(name: &str) -> bool {
    CATALOG.contains_key(name)
}

/// Look up the descriptor for a catalog column.
#[must_use]
pub fn descriptor(name: &str) -> Option<ColumnDescriptor> {
    CATALOG.get(name).copied()
}

/// The comma-joined SELECT list used by every main-table read.
#[must_use]
pub fn projection_sql() -> &'static str {
    &PROJECTION_SQL
}

/// The projection with each column prefixed by a table alias.
#[must_use]
pub fn aliased_projection(alias: &str) -> String {
    PROJECTION_COLUMNS
        .iter()
        .map(|col| format!("{alias}.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_covers_all_slots() {
        assert!(is_main_column("text_01"));
        assert!(is_main_column("text_10"));
        assert!(is_main_column("smallint_03"));
        assert!(is_main_column("uuid_02"));
        assert!(is_main_column(COL_ROW_ID));
        assert!(!is_main_column("text_11"));
        assert!(!is_main_column("smallint_04"));
        assert!(!is_main_column("status"));
    }

    #[test]
    fn descriptors_carry_kinds() {
        assert_eq!(descriptor("text_05").unwrap().kind, ColumnKind::Text);
        assert_eq!(descriptor("bigint_02").unwrap().kind, ColumnKind::BigInt);
        assert_eq!(descriptor(COL_SCHEMA_ID).unwrap().kind, ColumnKind::System);
        assert!(descriptor("double_04").is_none());
    }

    #[test]
    fn projection_starts_with_system_columns() {
        let projection = projection_sql();
        assert!(projection.starts_with("ltbase_schema_id, ltbase_row_id, ltbase_created_at"));
        assert!(projection.ends_with("uuid_01, uuid_02"));
        assert_eq!(PROJECTION_COLUMNS.len(), 5 + 10 + 3 + 3 + 3 + 3 + 2);
    }

    #[test]
    fn aliased_projection_prefixes_every_column() {
        let aliased = aliased_projection("m");
        assert!(aliased.starts_with("m.ltbase_schema_id"));
        assert!(aliased.contains("m.text_01"));
        assert!(!aliased.contains(" text_01"));
    }
}
