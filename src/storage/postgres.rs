//! Hot-tier repository over PostgreSQL.
//!
//! All writes run the same transaction protocol: main row, EAV replace,
//! change-log upsert, commit. Rollback is the drop path, a no-op after
//! commit. `now()` is injected through a clock function so timestamps are
//! deterministic under test.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deadpool_postgres::Pool;
use futures_util::{TryStreamExt, pin_mut};
use tokio_postgres::types::ToSql;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StorageTables;
use crate::error::{LtBaseError, Result};
use crate::layout::{
    COL_CREATED_AT, COL_DELETED_AT, COL_ROW_ID, COL_SCHEMA_ID, COL_UPDATED_AT, ColumnKind,
    PROJECTION_COLUMNS, projection_sql,
};
use crate::query::condition::{Anchor, classify_anchor, to_hybrid_clause};
use crate::query::paged::{PagedQueryParams, SqlDialect, build_paged_query, resolve_sort_keys};
use crate::query::{FederatedQuery, PageCounters, QueryPage};
use crate::record::{EAVRecord, PersistentRecord, ScalarValue};
use crate::schema::MetadataCache;
use crate::storage::changelog::{self, ChangeLogEntry};
use crate::util::sanitize;

/// Page size applied when the caller passes a non-positive limit.
pub const DEFAULT_PAGE_LIMIT: i64 = 50;
/// EAV rows per batched INSERT.
const EAV_INSERT_BATCH: usize = 500;
/// Pool liveness probes abort after this long.
const POOL_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Injectable millisecond clock.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

type PgParam = Box<dyn ToSql + Sync + Send>;

fn wall_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp_millis())
}

/// CRUD and paged reads over main + EAV + change log.
pub struct PostgresRepository {
    pool: Pool,
    cache: Arc<MetadataCache>,
    clock: Clock,
}

impl PostgresRepository {
    #[must_use]
    pub fn new(pool: Pool, cache: Arc<MetadataCache>) -> Self {
        Self {
            pool,
            cache,
            clock: wall_clock(),
        }
    }

    /// Replace the clock; tests use this to pin timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<MetadataCache> {
        &self.cache
    }

    /// Pool liveness probe with a 5 second deadline.
    pub async fn ping(&self) -> Result<()> {
        let conn = tokio::time::timeout(POOL_PING_TIMEOUT, self.pool.get())
            .await
            .map_err(|_| LtBaseError::Timeout { context: "pool ping" })??;
        tokio::time::timeout(POOL_PING_TIMEOUT, conn.simple_query("SELECT 1"))
            .await
            .map_err(|_| LtBaseError::Timeout { context: "pool ping" })?
            .map_err(LtBaseError::driver("pool ping"))?;
        Ok(())
    }

    /// Insert a new record. Sets both timestamps to now and writes main,
    /// EAV, and the change log in one transaction.
    pub async fn insert(
        &self,
        tables: &StorageTables,
        record: &mut PersistentRecord,
    ) -> Result<()> {
        tables.validate_for_read()?;
        if record.schema_id <= 0 {
            return Err(LtBaseError::InvalidSchemaId {
                schema_id: record.schema_id,
            });
        }
        let columns = record.bucket_columns()?;
        let now = (self.clock)();
        record.created_at = now;
        record.updated_at = now;

        let mut conn = self.pool.get().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(LtBaseError::driver("begin transaction"))?;

        let main = sanitize(&tables.main);
        let mut col_names = vec![
            COL_SCHEMA_ID.to_string(),
            COL_ROW_ID.to_string(),
            COL_CREATED_AT.to_string(),
            COL_UPDATED_AT.to_string(),
        ];
        let mut args: Vec<PgParam> = vec![
            Box::new(record.schema_id),
            Box::new(record.row_id),
            Box::new(record.created_at),
            Box::new(record.updated_at),
        ];
        if let Some(deleted_at) = record.deleted_at {
            col_names.push(COL_DELETED_AT.to_string());
            args.push(Box::new(deleted_at));
        }
        for (name, value) in &columns {
            col_names.push(sanitize(name));
            args.push(value.to_pg());
        }
        let placeholders = (1..=args.len())
            .map(|n| format!("${n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {main} ({}) VALUES ({placeholders})",
            col_names.join(", ")
        );
        tx.execute(&sql, &param_refs(&args))
            .await
            .map_err(LtBaseError::driver("insert main row"))?;

        insert_eav_rows(&tx, &tables.eav, &record.other_attributes).await?;
        self.mark_changed(&tx, tables, record.schema_id, record.row_id, now, None)
            .await?;

        tx.commit()
            .await
            .map_err(LtBaseError::driver("commit transaction"))?;
        debug!(schema_id = record.schema_id, row_id = %record.row_id, "record inserted");
        Ok(())
    }

    /// Update an existing record: main fields merged, EAV fully replaced,
    /// `updated_at` touched, `created_at` preserved.
    pub async fn update(
        &self,
        tables: &StorageTables,
        record: &mut PersistentRecord,
    ) -> Result<()> {
        tables.validate_for_read()?;
        if record.schema_id <= 0 {
            return Err(LtBaseError::InvalidSchemaId {
                schema_id: record.schema_id,
            });
        }
        let columns = record.bucket_columns()?;
        let now = (self.clock)();
        record.updated_at = now;

        let mut conn = self.pool.get().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(LtBaseError::driver("begin transaction"))?;

        let main = sanitize(&tables.main);
        let mut set_clauses = vec![format!("{COL_UPDATED_AT} = $1")];
        let mut args: Vec<PgParam> = vec![Box::new(record.updated_at)];
        if let Some(deleted_at) = record.deleted_at {
            args.push(Box::new(deleted_at));
            set_clauses.push(format!("{COL_DELETED_AT} = ${}", args.len()));
        }
        for (name, value) in &columns {
            args.push(value.to_pg());
            set_clauses.push(format!("{} = ${}", sanitize(name), args.len()));
        }
        args.push(Box::new(record.schema_id));
        let schema_pos = args.len();
        args.push(Box::new(record.row_id));
        let row_pos = args.len();
        let sql = format!(
            "UPDATE {main} SET {} WHERE {COL_SCHEMA_ID} = ${schema_pos} AND {COL_ROW_ID} = ${row_pos}",
            set_clauses.join(", ")
        );
        let touched = tx
            .execute(&sql, &param_refs(&args))
            .await
            .map_err(LtBaseError::driver("update main row"))?;
        if touched == 0 {
            return Err(LtBaseError::RowNotFound {
                schema_id: record.schema_id,
                row_id: record.row_id,
            });
        }

        let eav = sanitize(&tables.eav);
        tx.execute(
            &format!("DELETE FROM {eav} WHERE schema_id = $1 AND row_id = $2"),
            &[&record.schema_id, &record.row_id],
        )
        .await
        .map_err(LtBaseError::driver("delete eav attributes"))?;
        insert_eav_rows(&tx, &tables.eav, &record.other_attributes).await?;
        self.mark_changed(&tx, tables, record.schema_id, record.row_id, now, None)
            .await?;

        tx.commit()
            .await
            .map_err(LtBaseError::driver("commit transaction"))?;
        debug!(schema_id = record.schema_id, row_id = %record.row_id, "record updated");
        Ok(())
    }

    /// Hard-delete a record from main and EAV, leaving a tombstone entry in
    /// the change log. Returns whether a main row existed.
    pub async fn delete(
        &self,
        tables: &StorageTables,
        schema_id: i16,
        row_id: Uuid,
    ) -> Result<bool> {
        tables.validate_for_read()?;
        let now = (self.clock)();

        let mut conn = self.pool.get().await?;
        let tx = conn
            .transaction()
            .await
            .map_err(LtBaseError::driver("begin transaction"))?;

        let main = sanitize(&tables.main);
        let removed = tx
            .execute(
                &format!("DELETE FROM {main} WHERE {COL_SCHEMA_ID} = $1 AND {COL_ROW_ID} = $2"),
                &[&schema_id, &row_id],
            )
            .await
            .map_err(LtBaseError::driver("delete main row"))?;

        let eav = sanitize(&tables.eav);
        tx.execute(
            &format!("DELETE FROM {eav} WHERE schema_id = $1 AND row_id = $2"),
            &[&schema_id, &row_id],
        )
        .await
        .map_err(LtBaseError::driver("delete eav attributes"))?;

        self.mark_changed(&tx, tables, schema_id, row_id, now, Some(now))
            .await?;

        tx.commit()
            .await
            .map_err(LtBaseError::driver("commit transaction"))?;
        debug!(schema_id, row_id = %row_id, removed = removed > 0, "record deleted");
        Ok(removed > 0)
    }

    /// Read one record; `None` when the row does not exist.
    pub async fn get(
        &self,
        tables: &StorageTables,
        schema_id: i16,
        row_id: Uuid,
    ) -> Result<Option<PersistentRecord>> {
        tables.validate_for_read()?;
        let conn = self.pool.get().await?;

        let main = sanitize(&tables.main);
        let sql = format!(
            "SELECT {} FROM {main} WHERE {COL_SCHEMA_ID} = $1 AND {COL_ROW_ID} = $2",
            projection_sql()
        );
        let Some(row) = conn
            .query_opt(&sql, &[&schema_id, &row_id])
            .await
            .map_err(LtBaseError::driver("read main row"))?
        else {
            return Ok(None);
        };
        let mut record = scan_main_columns(&row)?;

        let eav = sanitize(&tables.eav);
        let eav_sql = format!(
            "SELECT schema_id, row_id, attr_id, array_indices, value_text, value_numeric \
             FROM {eav} WHERE schema_id = $1 AND row_id = $2 ORDER BY attr_id, array_indices"
        );
        let rows = conn
            .query(&eav_sql, &[&schema_id, &row_id])
            .await
            .map_err(LtBaseError::driver("read eav attributes"))?;
        record.other_attributes = rows
            .iter()
            .map(|row| EAVRecord {
                schema_id: row.get(0),
                row_id: row.get(1),
                attr_id: row.get(2),
                array_indices: row.get(3),
                value_text: row.get(4),
                value_numeric: row.get(5),
            })
            .collect();
        Ok(Some(record))
    }

    /// Paged query accumulating a full page.
    pub async fn query(&self, tables: &StorageTables, query: &FederatedQuery) -> Result<QueryPage> {
        let mut records = Vec::new();
        let counters = self
            .query_streaming(tables, query, |record| {
                records.push(record);
                Ok(())
            })
            .await?;
        Ok(QueryPage { records, counters })
    }

    /// Streaming paged query: the handler runs once per row, and only the
    /// pagination counters are returned.
    pub async fn query_streaming<F>(
        &self,
        tables: &StorageTables,
        query: &FederatedQuery,
        mut handler: F,
    ) -> Result<PageCounters>
    where
        F: FnMut(PersistentRecord) -> Result<()>,
    {
        tables.validate_for_read()?;
        let schema_id =
            self.cache
                .schema_id(&query.schema)
                .ok_or_else(|| LtBaseError::SchemaNotFound {
                    schema: query.schema.clone(),
                })?;
        let attrs =
            self.cache
                .attributes(&query.schema)
                .ok_or_else(|| LtBaseError::SchemaNotFound {
                    schema: query.schema.clone(),
                })?;

        let limit = if query.limit <= 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            query.limit
        };
        let offset = query.offset.max(0);

        let anchor = match query.hints.use_main_as_anchor {
            Some(true) => Anchor::Main,
            Some(false) => Anchor::Eav,
            None => classify_anchor(query.condition.as_ref(), &attrs),
        };

        let mut param_index = 2;
        let hybrid = to_hybrid_clause(
            query.condition.as_ref(),
            &tables.main,
            &tables.eav,
            &attrs,
            anchor,
            &mut param_index,
        )?;
        let sort_keys = resolve_sort_keys(&query.sort, &attrs);

        let paged = build_paged_query(&PagedQueryParams {
            dialect: SqlDialect::Postgres,
            main_table: &tables.main,
            eav_table: &tables.eav,
            anchor,
            condition_sql: &hybrid.clause,
            condition_args: &hybrid.args,
            exclusion_sql: "",
            exclusion_args: &[],
            sort_keys: &sort_keys,
            schema_id,
            limit,
            offset,
            next_param_index: param_index,
        })?;

        let conn = self.pool.get().await?;
        let params: Vec<PgParam> = paged.args.iter().map(ScalarValue::to_pg).collect();
        let stream = conn
            .query_raw(paged.sql.as_str(), params)
            .await
            .map_err(LtBaseError::driver("execute paged query"))?;
        pin_mut!(stream);

        let mut counters = PageCounters::default();
        while let Some(row) = stream
            .try_next()
            .await
            .map_err(LtBaseError::driver("stream paged row"))?
        {
            let (record, row_counters) = scan_paged_row(&row)?;
            counters = row_counters;
            handler(record)?;
        }
        Ok(counters)
    }

    /// All dirty row ids of one schema. An empty change log yields an empty
    /// list, not an error.
    pub async fn fetch_dirty_row_ids(&self, change_log: &str, schema_id: i16) -> Result<Vec<Uuid>> {
        let sql = changelog::dirty_row_ids_sql(change_log)?;
        let conn = self.pool.get().await?;
        let rows = conn
            .query(&sql, &[&schema_id])
            .await
            .map_err(LtBaseError::driver("fetch dirty row ids"))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Dirty change-log entries of one schema, newest first.
    pub async fn dirty_entries(
        &self,
        change_log: &str,
        schema_id: i16,
    ) -> Result<Vec<ChangeLogEntry>> {
        let sql = changelog::dirty_entries_sql(change_log)?;
        let conn = self.pool.get().await?;
        let rows = conn
            .query(&sql, &[&schema_id])
            .await
            .map_err(LtBaseError::driver("fetch dirty entries"))?;
        Ok(rows
            .iter()
            .map(|row| ChangeLogEntry {
                schema_id: row.get(0),
                row_id: row.get(1),
                flushed_at: row.get(2),
                changed_at: row.get(3),
                deleted_at: row.get(4),
            })
            .collect())
    }

    async fn mark_changed(
        &self,
        tx: &deadpool_postgres::Transaction<'_>,
        tables: &StorageTables,
        schema_id: i16,
        row_id: Uuid,
        changed_at: i64,
        deleted_at: Option<i64>,
    ) -> Result<()> {
        let Some(change_log) = &tables.change_log else {
            warn!(schema_id, "no change log configured, write not tracked");
            return Ok(());
        };
        let sql = changelog::upsert_sql(change_log)?;
        tx.execute(&sql, &[&schema_id, &row_id, &changed_at, &deleted_at])
            .await
            .map_err(LtBaseError::driver("upsert change log"))?;
        Ok(())
    }
}

fn param_refs(args: &[PgParam]) -> Vec<&(dyn ToSql + Sync)> {
    args.iter()
        .map(|arg| {
            let param: &(dyn ToSql + Sync) = arg.as_ref();
            param
        })
        .collect()
}

async fn insert_eav_rows(
    tx: &deadpool_postgres::Transaction<'_>,
    eav_table: &str,
    rows: &[EAVRecord],
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let eav = sanitize(eav_table);
    for chunk in rows.chunks(EAV_INSERT_BATCH) {
        let mut sql = format!(
            "INSERT INTO {eav} (schema_id, row_id, attr_id, array_indices, value_text, value_numeric) VALUES "
        );
        let mut args: Vec<PgParam> = Vec::with_capacity(chunk.len() * 6);
        for (i, row) in chunk.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let base = i * 6;
            let _ = write!(
                sql,
                "(${}, ${}, ${}, ${}, ${}, ${})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6
            );
            args.push(Box::new(row.schema_id));
            args.push(Box::new(row.row_id));
            args.push(Box::new(row.attr_id));
            args.push(Box::new(row.array_indices.clone()));
            args.push(Box::new(row.value_text.clone()));
            args.push(Box::new(row.value_numeric));
        }
        tx.execute(&sql, &param_refs(&args))
            .await
            .map_err(LtBaseError::driver("insert eav attributes"))?;
    }
    Ok(())
}

/// Scan the main projection (columns `0..projection_width`) into a record,
/// resetting empty buckets to absent.
fn scan_main_columns(row: &tokio_postgres::Row) -> Result<PersistentRecord> {
    let mut record = PersistentRecord::default();
    for (idx, col) in PROJECTION_COLUMNS.iter().enumerate() {
        let Some(descriptor) = crate::layout::descriptor(col) else {
            continue;
        };
        match descriptor.kind {
            ColumnKind::System => match *col {
                COL_SCHEMA_ID => record.schema_id = try_get(row, idx)?,
                COL_ROW_ID => record.row_id = try_get(row, idx)?,
                COL_CREATED_AT => record.created_at = try_get(row, idx)?,
                COL_UPDATED_AT => record.updated_at = try_get(row, idx)?,
                COL_DELETED_AT => record.deleted_at = try_get(row, idx)?,
                _ => {}
            },
            ColumnKind::Text => {
                if let Some(value) = try_get::<Option<String>>(row, idx)? {
                    record.text.insert((*col).to_string(), value);
                }
            }
            ColumnKind::SmallInt => {
                if let Some(value) = try_get::<Option<i16>>(row, idx)? {
                    record.int16.insert((*col).to_string(), value);
                }
            }
            ColumnKind::Integer => {
                if let Some(value) = try_get::<Option<i32>>(row, idx)? {
                    record.int32.insert((*col).to_string(), value);
                }
            }
            ColumnKind::BigInt => {
                if let Some(value) = try_get::<Option<i64>>(row, idx)? {
                    record.int64.insert((*col).to_string(), value);
                }
            }
            ColumnKind::Double => {
                if let Some(value) = try_get::<Option<f64>>(row, idx)? {
                    record.float64.insert((*col).to_string(), value);
                }
            }
            ColumnKind::Uuid => {
                if let Some(value) = try_get::<Option<Uuid>>(row, idx)? {
                    record.uuid.insert((*col).to_string(), value);
                }
            }
        }
    }
    Ok(record)
}

fn try_get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Result<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get(idx)
        .map_err(LtBaseError::driver("scan main row"))
}

/// Scan one optimized-paged-query row: main projection, aggregated-EAV
/// JSON, pagination counters.
fn scan_paged_row(row: &tokio_postgres::Row) -> Result<(PersistentRecord, PageCounters)> {
    let mut record = scan_main_columns(row)?;
    let width = PROJECTION_COLUMNS.len();

    let attributes: Option<String> = try_get(row, width)?;
    if let Some(json) = attributes {
        record.other_attributes =
            serde_json::from_str(&json).map_err(|source| LtBaseError::AttributeJson {
                row_id: record.row_id,
                source,
            })?;
    }

    let counters = PageCounters {
        total_records: try_get(row, width + 1)?,
        total_pages: try_get(row, width + 2)?,
        current_page: try_get(row, width + 3)?,
    };
    Ok((record, counters))
}
