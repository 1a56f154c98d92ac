//! Cold-tier analytic engine client (DuckDB).
//!
//! A small fixed pool of connections behind a semaphore; the engine is
//! single-writer, so the pool stays tiny and pragma changes serialize.
//! Blocking engine work crosses into `spawn_blocking`. Extension installs
//! and optional pragmas are best-effort: they warn and continue; only a
//! failing liveness probe aborts open.

use std::sync::Arc;
use std::time::Duration;

use duckdb::Connection;
use once_cell::sync::OnceCell;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{LtBaseError, Result};
use crate::layout::{
    COL_CREATED_AT, COL_DELETED_AT, COL_ROW_ID, COL_SCHEMA_ID, COL_UPDATED_AT, ColumnKind,
    PROJECTION_COLUMNS,
};
use crate::query::PageCounters;
use crate::record::PersistentRecord;
use crate::util::to_uuid;

/// Liveness probes abort after this long.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

static GLOBAL_ENGINE: OnceCell<Arc<DuckDbClient>> = OnceCell::new();

/// Install the process-global engine handle. Wiring convenience only; the
/// federated coordinator takes an injected client.
pub fn set_global_engine(client: Arc<DuckDbClient>) {
    if GLOBAL_ENGINE.set(client).is_err() {
        warn!("global engine already set, ignoring");
    }
}

/// The process-global engine handle, if one was installed.
#[must_use]
pub fn global_engine() -> Option<Arc<DuckDbClient>> {
    GLOBAL_ENGINE.get().cloned()
}

/// Pooled cold-tier client.
pub struct DuckDbClient {
    config: EngineConfig,
    limiter: Arc<Semaphore>,
    pool: Arc<Mutex<Vec<Connection>>>,
}

impl DuckDbClient {
    /// Open the engine: seed the connection pool, apply session settings,
    /// and run the liveness probe.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let root = if config.is_in_memory() {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.db_path)
        }
        .map_err(LtBaseError::cold("open database"))?;

        apply_session_settings(&root, &config);

        // Only a failing liveness probe aborts open.
        root.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
            .map_err(LtBaseError::cold("liveness probe"))?;

        let mut connections = Vec::with_capacity(config.max_connections);
        for _ in 1..config.max_connections {
            let conn = root
                .try_clone()
                .map_err(LtBaseError::cold("clone connection"))?;
            apply_session_settings(&conn, &config);
            connections.push(conn);
        }
        connections.push(root);

        info!(
            db_path = if config.is_in_memory() {
                ":memory:"
            } else {
                config.db_path.as_str()
            },
            connections = config.max_connections,
            "cold tier engine opened"
        );
        Ok(Self {
            limiter: Arc::new(Semaphore::new(config.max_connections)),
            pool: Arc::new(Mutex::new(connections)),
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run blocking engine work on a pooled connection, bounded by the
    /// configured query timeout.
    pub async fn execute<T, F>(&self, context: &'static str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        self.execute_with_timeout(context, self.config.query_timeout(), work)
            .await
    }

    async fn execute_with_timeout<T, F>(
        &self,
        context: &'static str,
        timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| LtBaseError::ColdTierUnavailable)?;

        let conn = {
            let mut pool = self.pool.lock().await;
            pool.pop().ok_or(LtBaseError::ColdTierUnavailable)?
        };

        // The task returns the connection to the pool itself, so a caller
        // abandoning a timed-out future cannot leak it.
        let pool = Arc::clone(&self.pool);
        let task = tokio::task::spawn_blocking(move || {
            let result = work(&conn);
            pool.blocking_lock().push(conn);
            result
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(LtBaseError::Timeout { context }),
        }
    }

    /// `SELECT 1` liveness probe with a 3 second deadline.
    pub async fn health_check(&self) -> Result<()> {
        self.execute_with_timeout("health check", HEALTH_CHECK_TIMEOUT, |conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i32>(0))
                .map_err(LtBaseError::cold("health check"))?;
            Ok(())
        })
        .await
    }

    /// Run a DDL/utility script.
    pub async fn execute_batch(&self, sql: String) -> Result<()> {
        self.execute("execute batch", move |conn| {
            conn.execute_batch(&sql)
                .map_err(LtBaseError::cold("execute batch"))
        })
        .await
    }

    /// Run one statement with positional parameters; returns affected rows.
    pub async fn execute_sql(
        &self,
        sql: String,
        args: Vec<duckdb::types::Value>,
    ) -> Result<usize> {
        self.execute("execute statement", move |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(LtBaseError::cold("prepare statement"))?;
            stmt.execute(duckdb::params_from_iter(args))
                .map_err(LtBaseError::cold("execute statement"))
        })
        .await
    }

    /// Execute a rendered paged-query template and scan the page.
    pub async fn query_paged(
        &self,
        sql: String,
        args: Vec<duckdb::types::Value>,
    ) -> Result<Vec<(PersistentRecord, PageCounters)>> {
        debug!(sql = %sql, "cold tier paged query");
        self.execute("execute paged query", move |conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(LtBaseError::cold("prepare paged query"))?;
            let mut rows = stmt
                .query(duckdb::params_from_iter(args))
                .map_err(LtBaseError::cold("execute paged query"))?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().map_err(LtBaseError::cold("stream paged row"))? {
                out.push(scan_paged_row(row)?);
            }
            Ok(out)
        })
        .await
    }
}

/// Apply memory/thread pragmas, extensions, and object-store credentials.
/// Everything here is best-effort.
fn apply_session_settings(conn: &Connection, config: &EngineConfig) {
    let mut settings: Vec<String> = Vec::new();
    if config.memory_limit_mb > 0 {
        settings.push(format!("SET memory_limit = '{}MB'", config.memory_limit_mb));
    }
    if config.max_parallelism > 0 {
        settings.push(format!("SET threads = {}", config.max_parallelism));
    }

    for extension in &config.extensions {
        let name = extension.trim();
        if name.is_empty() {
            continue;
        }
        if let Err(error) = conn.execute_batch(&format!("INSTALL {name}; LOAD {name};")) {
            warn!(extension = %name, %error, "extension load failed, continuing");
        }
    }

    let store = &config.object_store;
    if store.is_configured() {
        settings.push(format!("SET s3_access_key_id = '{}'", store.access_key_id));
        settings.push(format!(
            "SET s3_secret_access_key = '{}'",
            store.secret_access_key
        ));
        if !store.region.is_empty() {
            settings.push(format!("SET s3_region = '{}'", store.region));
        }
        if !store.endpoint.is_empty() {
            settings.push(format!("SET s3_endpoint = '{}'", store.endpoint));
        }
    }

    for setting in settings {
        if let Err(error) = conn.execute_batch(&setting) {
            warn!(%error, "session setting failed, continuing");
        }
    }
}

/// Scan one cold-tier paged row. The template casts uuid columns to text,
/// so both tiers scan into the same record shape.
fn scan_paged_row(row: &duckdb::Row<'_>) -> Result<(PersistentRecord, PageCounters)> {
    let mut record = PersistentRecord::default();
    for (idx, col) in PROJECTION_COLUMNS.iter().enumerate() {
        let Some(descriptor) = crate::layout::descriptor(col) else {
            continue;
        };
        match descriptor.kind {
            ColumnKind::System => match *col {
                COL_SCHEMA_ID => record.schema_id = get(row, idx)?,
                COL_ROW_ID => {
                    let raw: String = get(row, idx)?;
                    record.row_id = to_uuid(&raw)?;
                }
                COL_CREATED_AT => record.created_at = get(row, idx)?,
                COL_UPDATED_AT => record.updated_at = get(row, idx)?,
                COL_DELETED_AT => record.deleted_at = get(row, idx)?,
                _ => {}
            },
            ColumnKind::Text => {
                if let Some(value) = get::<Option<String>>(row, idx)? {
                    record.text.insert((*col).to_string(), value);
                }
            }
            ColumnKind::SmallInt => {
                if let Some(value) = get::<Option<i16>>(row, idx)? {
                    record.int16.insert((*col).to_string(), value);
                }
            }
            ColumnKind::Integer => {
                if let Some(value) = get::<Option<i32>>(row, idx)? {
                    record.int32.insert((*col).to_string(), value);
                }
            }
            ColumnKind::BigInt => {
                if let Some(value) = get::<Option<i64>>(row, idx)? {
                    record.int64.insert((*col).to_string(), value);
                }
            }
            ColumnKind::Double => {
                if let Some(value) = get::<Option<f64>>(row, idx)? {
                    record.float64.insert((*col).to_string(), value);
                }
            }
            ColumnKind::Uuid => {
                if let Some(value) = get::<Option<String>>(row, idx)? {
                    record.uuid.insert((*col).to_string(), to_uuid(&value)?);
                }
            }
        }
    }

    let width = PROJECTION_COLUMNS.len();
    let attributes: Option<String> = get(row, width)?;
    if let Some(json) = attributes {
        record.other_attributes =
            serde_json::from_str(&json).map_err(|source| LtBaseError::AttributeJson {
                row_id: record.row_id,
                source,
            })?;
    }

    let counters = PageCounters {
        total_records: get(row, width + 1)?,
        total_pages: get(row, width + 2)?,
        current_page: get(row, width + 3)?,
    };
    Ok((record, counters))
}

fn get<T: duckdb::types::FromSql>(row: &duckdb::Row<'_>, idx: usize) -> Result<T> {
    row.get(idx).map_err(LtBaseError::cold("scan paged row"))
}

/// The dirty-id exclusion values in bind order.
#[must_use]
pub fn exclusion_args(dirty_ids: &[Uuid]) -> Vec<crate::record::ScalarValue> {
    dirty_ids
        .iter()
        .map(|id| crate::record::ScalarValue::Uuid(*id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> EngineConfig {
        EngineConfig {
            enabled: true,
            max_connections: 2,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn open_and_probe_in_memory() {
        let client = DuckDbClient::open(test_config()).await.unwrap();
        client.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn pooled_connections_share_the_database() {
        let client = DuckDbClient::open(test_config()).await.unwrap();
        client
            .execute_batch("CREATE TABLE t (v INTEGER); INSERT INTO t VALUES (41)".to_string())
            .await
            .unwrap();
        // A second call may land on a different pooled connection.
        for _ in 0..3 {
            let count: i64 = client
                .execute("count", |conn| {
                    conn.query_row("SELECT count(*) FROM t", [], |row| row.get(0))
                        .map_err(LtBaseError::cold("count"))
                })
                .await
                .unwrap();
            assert_eq!(count, 1);
        }
    }

    #[tokio::test]
    async fn empty_extension_list_installs_nothing() {
        let config = test_config();
        assert!(config.extensions.is_empty());
        // Open succeeds without any INSTALL round trips.
        DuckDbClient::open(config).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_extension_warns_but_opens() {
        let config = EngineConfig {
            extensions: vec!["definitely_not_an_extension".to_string()],
            ..test_config()
        };
        DuckDbClient::open(config).await.unwrap();
    }
}
