//! Change log and dirty-row tracking.
//!
//! One table, one contract: a row is dirty iff it has an entry with
//! `flushed_at = 0`. Writes upsert that entry; the flush pipeline (outside
//! this crate) rotates dirty entries forward by inserting a second entry
//! with a non-zero `flushed_at`. Read paths never delete log rows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LtBaseError, Result};
use crate::util::sanitize;

/// One change-log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub schema_id: i16,
    pub row_id: Uuid,
    /// 0 while the row is dirty; a flush timestamp afterwards.
    pub flushed_at: i64,
    pub changed_at: i64,
    #[serde(default)]
    pub deleted_at: Option<i64>,
}

impl ChangeLogEntry {
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.flushed_at == 0
    }
}

/// Upsert statement marking a row dirty. Conflicts update `changed_at` and
/// `deleted_at` only; the dirty entry itself is never replaced.
pub fn upsert_sql(change_log: &str) -> Result<String> {
    let table = require(change_log)?;
    Ok(format!(
        "INSERT INTO {table} (schema_id, row_id, flushed_at, changed_at, deleted_at) \
         VALUES ($1, $2, 0, $3, $4) \
         ON CONFLICT (schema_id, row_id, flushed_at) \
         DO UPDATE SET changed_at = EXCLUDED.changed_at, deleted_at = EXCLUDED.deleted_at"
    ))
}

/// Statement listing the dirty row ids of one schema.
pub fn dirty_row_ids_sql(change_log: &str) -> Result<String> {
    let table = require(change_log)?;
    Ok(format!(
        "SELECT row_id FROM {table} WHERE schema_id = $1 AND flushed_at = 0"
    ))
}

/// Statement reading the dirty entries of one schema, newest first.
pub fn dirty_entries_sql(change_log: &str) -> Result<String> {
    let table = require(change_log)?;
    Ok(format!(
        "SELECT schema_id, row_id, flushed_at, changed_at, deleted_at FROM {table} \
         WHERE schema_id = $1 AND flushed_at = 0 ORDER BY changed_at DESC"
    ))
}

fn require(change_log: &str) -> Result<String> {
    let table = sanitize(change_log);
    if table.is_empty() {
        return Err(LtBaseError::EmptyTableName {
            context: "change log table",
        });
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_contract() {
        let entry = ChangeLogEntry {
            schema_id: 1,
            row_id: Uuid::new_v4(),
            flushed_at: 0,
            changed_at: 100,
            deleted_at: None,
        };
        assert!(entry.is_dirty());
        let flushed = ChangeLogEntry {
            flushed_at: 200,
            ..entry
        };
        assert!(!flushed.is_dirty());
    }

    #[test]
    fn upsert_touches_timestamps_only() {
        let sql = upsert_sql("entity_changes").unwrap();
        assert!(sql.contains("VALUES ($1, $2, 0, $3, $4)"));
        assert!(sql.contains("ON CONFLICT (schema_id, row_id, flushed_at)"));
        assert!(sql.contains("DO UPDATE SET changed_at = EXCLUDED.changed_at"));
        assert!(!sql.contains("DELETE"));
    }

    #[test]
    fn dirty_queries_filter_on_unflushed() {
        let sql = dirty_row_ids_sql("entity_changes").unwrap();
        assert!(sql.contains("flushed_at = 0"));
        assert!(dirty_row_ids_sql(" ").is_err());
    }
}
