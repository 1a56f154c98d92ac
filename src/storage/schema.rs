//! Table DDL and idempotent schema application.
//!
//! DDL is rendered per deployment from the configured table names; slot
//! columns are generated from the layout catalog so the two never drift.
//! All statements use `IF NOT EXISTS` and may be re-applied at startup.

use std::fmt::Write as _;

use tokio_postgres::GenericClient;
use tracing::info;

use crate::config::StorageTables;
use crate::error::{LtBaseError, Result};
use crate::layout::{
    BIGINT_COLUMNS, DOUBLE_COLUMNS, INTEGER_COLUMNS, SMALLINT_COLUMNS, TEXT_COLUMNS, UUID_COLUMNS,
};
use crate::util::sanitize;

/// Slot-column DDL fragment, in catalog order.
fn slot_columns(double_type: &str) -> String {
    let mut out = String::new();
    let groups: &[(&[&str], &str)] = &[
        (TEXT_COLUMNS, "text"),
        (SMALLINT_COLUMNS, "smallint"),
        (INTEGER_COLUMNS, "integer"),
        (BIGINT_COLUMNS, "bigint"),
        (DOUBLE_COLUMNS, double_type),
        (UUID_COLUMNS, "uuid"),
    ];
    for (columns, sql_type) in groups {
        for col in *columns {
            let _ = writeln!(out, "    {col} {sql_type},");
        }
    }
    out
}

/// Index-name-safe base derived from a table reference.
fn index_base(table: &str) -> String {
    table
        .rsplit('.')
        .next()
        .unwrap_or(table)
        .trim()
        .trim_matches('"')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Hot-tier main table.
pub fn main_table_ddl(table: &str) -> Result<String> {
    let name = require_table(table, "main table")?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {name} (\n    ltbase_schema_id smallint NOT NULL,\n    ltbase_row_id uuid NOT NULL,\n    ltbase_created_at bigint NOT NULL,\n    ltbase_updated_at bigint NOT NULL,\n    ltbase_deleted_at bigint,\n{slots}    PRIMARY KEY (ltbase_schema_id, ltbase_row_id)\n)",
        slots = slot_columns("double precision"),
    ))
}

/// Hot-tier EAV table plus its attribute lookup index.
pub fn eav_table_ddl(table: &str) -> Result<Vec<String>> {
    let name = require_table(table, "eav table")?;
    let base = index_base(table);
    Ok(vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (\n    schema_id smallint NOT NULL,\n    row_id uuid NOT NULL,\n    attr_id smallint NOT NULL,\n    array_indices text NOT NULL DEFAULT '',\n    value_text text,\n    value_numeric double precision,\n    PRIMARY KEY (schema_id, row_id, attr_id, array_indices)\n)"
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{base}_attr ON {name} (schema_id, attr_id)"),
    ])
}

/// Change-log table plus the partial index serving dirty-row reads.
pub fn change_log_ddl(table: &str) -> Result<Vec<String>> {
    let name = require_table(table, "change log table")?;
    let base = index_base(table);
    Ok(vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {name} (\n    schema_id smallint NOT NULL,\n    row_id uuid NOT NULL,\n    flushed_at bigint NOT NULL DEFAULT 0,\n    changed_at bigint NOT NULL,\n    deleted_at bigint,\n    PRIMARY KEY (schema_id, row_id, flushed_at)\n)"
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS idx_{base}_dirty ON {name} (schema_id) WHERE flushed_at = 0"
        ),
    ])
}

/// Schema registry table.
pub fn registry_table_ddl(table: &str) -> Result<String> {
    let name = require_table(table, "schema registry")?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {name} (\n    schema_name text PRIMARY KEY,\n    schema_id smallint NOT NULL\n)"
    ))
}

/// Cold-tier mirror of the main table (DuckDB types).
pub fn cold_main_table_ddl(table: &str) -> Result<String> {
    let name = require_table(table, "main table")?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {name} (\n    ltbase_schema_id SMALLINT NOT NULL,\n    ltbase_row_id UUID NOT NULL,\n    ltbase_created_at BIGINT NOT NULL,\n    ltbase_updated_at BIGINT NOT NULL,\n    ltbase_deleted_at BIGINT,\n{slots}    PRIMARY KEY (ltbase_schema_id, ltbase_row_id)\n)",
        slots = slot_columns("DOUBLE"),
    ))
}

/// Cold-tier mirror of the EAV table (DuckDB types).
pub fn cold_eav_table_ddl(table: &str) -> Result<String> {
    let name = require_table(table, "eav table")?;
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {name} (\n    schema_id SMALLINT NOT NULL,\n    row_id UUID NOT NULL,\n    attr_id SMALLINT NOT NULL,\n    array_indices VARCHAR NOT NULL DEFAULT '',\n    value_text VARCHAR,\n    value_numeric DOUBLE,\n    PRIMARY KEY (schema_id, row_id, attr_id, array_indices)\n)"
    ))
}

fn require_table(table: &str, context: &'static str) -> Result<String> {
    let name = sanitize(table);
    if name.is_empty() {
        return Err(LtBaseError::EmptyTableName { context });
    }
    Ok(name)
}

/// Apply the hot-tier schema: main, EAV, optional change log, optional
/// registry. Safe to re-run.
pub async fn apply_schema<C>(
    client: &C,
    tables: &StorageTables,
    registry_table: Option<&str>,
) -> Result<()>
where
    C: GenericClient + Sync,
{
    let mut statements = vec![main_table_ddl(&tables.main)?];
    statements.extend(eav_table_ddl(&tables.eav)?);
    if let Some(log) = &tables.change_log {
        statements.extend(change_log_ddl(log)?);
    }
    if let Some(registry) = registry_table {
        statements.push(registry_table_ddl(registry)?);
    }

    for statement in &statements {
        client
            .execute(statement.as_str(), &[])
            .await
            .map_err(LtBaseError::driver("apply schema"))?;
    }
    info!(
        main = %tables.main,
        eav = %tables.eav,
        change_log = tables.change_log.as_deref().unwrap_or("<none>"),
        "storage schema applied"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_ddl_carries_all_slots() {
        let ddl = main_table_ddl("entity_main").unwrap();
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS \"entity_main\""));
        assert!(ddl.contains("text_10 text"));
        assert!(ddl.contains("smallint_03 smallint"));
        assert!(ddl.contains("double_03 double precision"));
        assert!(ddl.contains("uuid_02 uuid"));
        assert!(ddl.contains("PRIMARY KEY (ltbase_schema_id, ltbase_row_id)"));
    }

    #[test]
    fn eav_ddl_has_pk_and_index() {
        let statements = eav_table_ddl("public.entity_eav").unwrap();
        assert!(statements[0].contains("PRIMARY KEY (schema_id, row_id, attr_id, array_indices)"));
        assert!(statements[0].contains("array_indices text NOT NULL DEFAULT ''"));
        assert!(statements[1].contains("idx_entity_eav_attr"));
    }

    #[test]
    fn change_log_ddl_has_dirty_index() {
        let statements = change_log_ddl("entity_changes").unwrap();
        assert!(statements[0].contains("flushed_at bigint NOT NULL DEFAULT 0"));
        assert!(statements[0].contains("PRIMARY KEY (schema_id, row_id, flushed_at)"));
        assert!(statements[1].contains("WHERE flushed_at = 0"));
    }

    #[test]
    fn empty_table_names_are_rejected() {
        assert!(main_table_ddl(" ").is_err());
        assert!(eav_table_ddl("").is_err());
        assert!(registry_table_ddl("\"\"").is_err());
    }
}
