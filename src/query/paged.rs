//! Optimized single-pass paged query.
//!
//! One statement, CTEs in a fixed order: `anchor` → `keys` → `ordered` →
//! `main_data` joined with `eav_aggregated`. The final projection carries
//! the full main-column list, the aggregated-EAV JSON, and the pagination
//! counters, so one round trip produces a complete page.

use std::fmt::Write as _;

use tracing::debug;

use crate::error::{LtBaseError, Result};
use crate::layout::{self, COL_ROW_ID, COL_SCHEMA_ID, ColumnKind, PROJECTION_COLUMNS};
use crate::query::SortKey;
use crate::query::condition::Anchor;
use crate::record::ScalarValue;
use crate::schema::SchemaAttributes;
use crate::util::sanitize;

/// The two SQL dialects the template renders to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    Postgres,
    DuckDb,
}

/// A sort key resolved against the metadata cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSortKey {
    /// Bound attribute or literal catalog column: direct column read.
    MainColumn { column: String, descending: bool },
    /// Unbound attribute: first-element subselect over the EAV table.
    Eav {
        attr_id: i16,
        textual: bool,
        descending: bool,
    },
}

impl ResolvedSortKey {
    const fn descending(&self) -> bool {
        match self {
            Self::MainColumn { descending, .. } | Self::Eav { descending, .. } => *descending,
        }
    }
}

/// Resolve caller sort keys; unknown attributes are dropped.
#[must_use]
pub fn resolve_sort_keys(keys: &[SortKey], attrs: &SchemaAttributes) -> Vec<ResolvedSortKey> {
    let mut resolved = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(meta) = attrs.get(&key.attr) {
            if let Some(binding) = &meta.column_binding {
                resolved.push(ResolvedSortKey::MainColumn {
                    column: binding.column_name.clone(),
                    descending: key.descending,
                });
            } else {
                resolved.push(ResolvedSortKey::Eav {
                    attr_id: meta.attribute_id,
                    textual: meta.value_type.is_textual(),
                    descending: key.descending,
                });
            }
        } else if layout::is_main_column(&key.attr) {
            resolved.push(ResolvedSortKey::MainColumn {
                column: key.attr.clone(),
                descending: key.descending,
            });
        } else {
            debug!(attr = %key.attr, "sort key not resolvable, dropped");
        }
    }
    resolved
}

/// Inputs of one template render.
#[derive(Debug)]
pub struct PagedQueryParams<'a> {
    pub dialect: SqlDialect,
    pub main_table: &'a str,
    pub eav_table: &'a str,
    pub anchor: Anchor,
    /// Compiled condition clause; empty means unconditional (`1=1`).
    pub condition_sql: &'a str,
    pub condition_args: &'a [ScalarValue],
    /// Extra anchor predicate (cold-tier dirty-row exclusion); may be empty.
    pub exclusion_sql: &'a str,
    pub exclusion_args: &'a [ScalarValue],
    pub sort_keys: &'a [ResolvedSortKey],
    pub schema_id: i16,
    pub limit: i64,
    pub offset: i64,
    /// First free `$n` index after the condition and exclusion placeholders
    /// (hot tier only; the cold tier is positional).
    pub next_param_index: usize,
}

/// A rendered statement plus its bind arguments, in bind order.
#[derive(Debug, Clone, PartialEq)]
pub struct PagedQuery {
    pub sql: String,
    pub args: Vec<ScalarValue>,
}

/// Number of leading main-projection columns in the final SELECT; the
/// aggregated-attribute JSON and the counters follow.
#[must_use]
pub fn projection_width() -> usize {
    PROJECTION_COLUMNS.len()
}

fn quoted(column: &str) -> String {
    match layout::descriptor(column) {
        Some(d) if d.kind == ColumnKind::System => column.to_string(),
        _ => sanitize(column),
    }
}

/// Projection for `main_data`, casting uuid columns to text for the cold
/// tier so both tiers scan identically.
fn dialect_projection(dialect: SqlDialect) -> String {
    PROJECTION_COLUMNS
        .iter()
        .map(|col| {
            let is_uuid = matches!(
                layout::descriptor(col).map(|d| d.kind),
                Some(ColumnKind::Uuid)
            ) || *col == COL_ROW_ID;
            if dialect == SqlDialect::DuckDb && is_uuid {
                format!("CAST(m.{col} AS VARCHAR) AS {col}")
            } else {
                format!("m.{col}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn final_projection() -> String {
    PROJECTION_COLUMNS
        .iter()
        .map(|col| format!("md.{col}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// JSON aggregation of the paged EAV rows, ordered by the EAV primary-key
/// tail, rendered as text for uniform scanning.
fn json_aggregation(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Postgres => {
            "(jsonb_agg(jsonb_build_object('schema_id', e.schema_id, 'row_id', e.row_id, \
             'attr_id', e.attr_id, 'array_indices', e.array_indices, 'value_text', e.value_text, \
             'value_numeric', e.value_numeric) ORDER BY e.attr_id, e.array_indices))::text"
        }
        SqlDialect::DuckDb => {
            "CAST(to_json(list(struct_pack(schema_id := e.schema_id, row_id := e.row_id, \
             attr_id := e.attr_id, array_indices := e.array_indices, value_text := e.value_text, \
             value_numeric := e.value_numeric) ORDER BY e.attr_id, e.array_indices)) AS VARCHAR)"
        }
    }
}

/// Render the paged statement and assemble its arguments in bind order.
pub fn build_paged_query(p: &PagedQueryParams<'_>) -> Result<PagedQuery> {
    if p.schema_id <= 0 {
        return Err(LtBaseError::InvalidSchemaId {
            schema_id: p.schema_id,
        });
    }
    let main = sanitize(p.main_table);
    if main.is_empty() {
        return Err(LtBaseError::EmptyTableName {
            context: "main table",
        });
    }
    let eav = sanitize(p.eav_table);
    if eav.is_empty() {
        return Err(LtBaseError::EmptyTableName { context: "eav table" });
    }

    let pg = p.dialect == SqlDialect::Postgres;
    let schema_ph = if pg { "$1".to_string() } else { "?".to_string() };
    let limit_ph = if pg {
        format!("${}", p.next_param_index)
    } else {
        "?".to_string()
    };
    let offset_ph = if pg {
        format!("${}", p.next_param_index + 1)
    } else {
        "?".to_string()
    };

    let condition = if p.condition_sql.is_empty() {
        "1=1"
    } else {
        p.condition_sql
    };

    let mut sql = String::with_capacity(2048);

    // anchor: distinct row keys under the compiled condition.
    match p.anchor {
        Anchor::Main => {
            let _ = write!(
                sql,
                "WITH anchor AS (\n  SELECT DISTINCT m.{COL_SCHEMA_ID} AS schema_id, m.{COL_ROW_ID} AS row_id\n  FROM {main} m\n  WHERE m.{COL_SCHEMA_ID} = {schema_ph} AND ({condition})"
            );
        }
        Anchor::Eav => {
            let _ = write!(
                sql,
                "WITH anchor AS (\n  SELECT DISTINCT t.schema_id AS schema_id, t.row_id AS row_id\n  FROM {eav} t\n  WHERE t.schema_id = {schema_ph} AND ({condition})"
            );
        }
    }
    if !p.exclusion_sql.is_empty() {
        let _ = write!(sql, " AND {}", p.exclusion_sql);
    }
    sql.push_str("\n),\n");

    // keys: one computed column per sort key plus the total-count window.
    sql.push_str("keys AS (\n  SELECT a.schema_id, a.row_id");
    for (i, key) in p.sort_keys.iter().enumerate() {
        match key {
            ResolvedSortKey::MainColumn { column, .. } => {
                let _ = write!(sql, ",\n    m.{} AS k{i}", quoted(column));
            }
            ResolvedSortKey::Eav {
                attr_id, textual, ..
            } => {
                let value_col = if *textual { "value_text" } else { "value_numeric" };
                let _ = write!(
                    sql,
                    ",\n    (SELECT e.{value_col} FROM {eav} e WHERE e.schema_id = a.schema_id AND e.row_id = a.row_id AND e.attr_id = {attr_id} ORDER BY e.array_indices NULLS FIRST LIMIT 1) AS k{i}"
                );
            }
        }
    }
    let _ = write!(
        sql,
        ",\n    COUNT(*) OVER () AS total\n  FROM anchor a\n  JOIN {main} m ON m.{COL_SCHEMA_ID} = a.schema_id AND m.{COL_ROW_ID} = a.row_id\n),\n"
    );

    // ordered: the paging cut, with the row id as the final tie-break.
    sql.push_str("ordered AS (\n  SELECT k.* FROM keys k\n  ORDER BY ");
    for (i, key) in p.sort_keys.iter().enumerate() {
        let dir = if key.descending() { "DESC" } else { "ASC" };
        let _ = write!(sql, "k.k{i} {dir}, ");
    }
    let _ = write!(
        sql,
        "k.row_id ASC\n  LIMIT {limit_ph} OFFSET {offset_ph}\n),\n"
    );

    // main_data: the full projection of the paged rows.
    let _ = write!(
        sql,
        "main_data AS (\n  SELECT o.total{keys}, {projection}\n  FROM ordered o\n  JOIN {main} m ON m.{COL_SCHEMA_ID} = o.schema_id AND m.{COL_ROW_ID} = o.row_id\n),\n",
        keys = (0..p.sort_keys.len())
            .map(|i| format!(", o.k{i}"))
            .collect::<String>(),
        projection = dialect_projection(p.dialect),
    );

    // eav_aggregated: the paged rows' EAV tail as ordered JSON.
    let _ = write!(
        sql,
        "eav_aggregated AS (\n  SELECT e.row_id, {agg} AS attributes\n  FROM {eav} e\n  WHERE e.schema_id = {schema_ph} AND e.row_id IN (SELECT row_id FROM ordered)\n  GROUP BY e.row_id\n)\n",
        agg = json_aggregation(p.dialect),
    );

    // final: page rows + counters, in the same order as the cut.
    let counters = if pg {
        format!(
            "md.total AS total_records, CEIL(md.total::numeric / {limit_ph})::bigint AS total_pages, (FLOOR({offset_ph}::numeric / {limit_ph}) + 1)::bigint AS current_page"
        )
    } else {
        "md.total AS total_records, CAST(CEIL(CAST(md.total AS DOUBLE) / ?) AS BIGINT) AS total_pages, CAST(FLOOR(CAST(? AS DOUBLE) / ?) + 1 AS BIGINT) AS current_page".to_string()
    };
    let _ = write!(
        sql,
        "SELECT {projection}, ea.attributes, {counters}\nFROM main_data md\nLEFT JOIN eav_aggregated ea ON ea.row_id = md.{COL_ROW_ID}\nORDER BY ",
        projection = final_projection(),
    );
    for (i, key) in p.sort_keys.iter().enumerate() {
        let dir = if key.descending() { "DESC" } else { "ASC" };
        let _ = write!(sql, "md.k{i} {dir}, ");
    }
    let _ = write!(sql, "md.{COL_ROW_ID} ASC");

    // Arguments in bind order. The hot tier reuses numbered placeholders;
    // the cold tier binds each occurrence.
    let mut args = Vec::new();
    args.push(ScalarValue::SmallInt(p.schema_id));
    args.extend_from_slice(p.condition_args);
    args.extend_from_slice(p.exclusion_args);
    args.push(ScalarValue::BigInt(p.limit));
    args.push(ScalarValue::BigInt(p.offset));
    if !pg {
        args.push(ScalarValue::SmallInt(p.schema_id));
        args.push(ScalarValue::BigInt(p.limit));
        args.push(ScalarValue::BigInt(p.offset));
        args.push(ScalarValue::BigInt(p.limit));
    }

    Ok(PagedQuery { sql, args })
}
