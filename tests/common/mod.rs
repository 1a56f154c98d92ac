//! Shared fixtures: a registered test schema, an in-memory cold tier, and
//! a repository whose pool never connects (cold-only tests).
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use ltbase::config::{EngineConfig, StorageTables};
use ltbase::schema::{AttributeMetadata, ColumnBinding, Encoding, MetadataCache, ValueType};
use ltbase::storage::schema as ddl;
use ltbase::storage::{DuckDbClient, PostgresRepository};
use uuid::Uuid;

pub const VISIT_SCHEMA: &str = "visit";
pub const VISIT_SCHEMA_ID: i16 = 9;

pub const ATTR_FEEDBACK: i16 = 5;
pub const ATTR_SCORE: i16 = 6;

fn attr(
    id: i16,
    value_type: ValueType,
    binding: Option<(&str, Encoding)>,
) -> AttributeMetadata {
    AttributeMetadata {
        attribute_id: id,
        value_type,
        column_binding: binding.map(|(column, encoding)| ColumnBinding {
            column_name: column.to_string(),
            encoding,
        }),
    }
}

/// Metadata cache with the `visit` schema registered.
pub fn visit_cache() -> Arc<MetadataCache> {
    let cache = MetadataCache::new();
    let mut attrs = HashMap::new();
    attrs.insert(
        "status".to_string(),
        attr(1, ValueType::Text, Some(("text_01", Encoding::Default))),
    );
    attrs.insert(
        "lead_id".to_string(),
        attr(2, ValueType::Uuid, Some(("uuid_01", Encoding::Default))),
    );
    attrs.insert(
        "visited_at".to_string(),
        attr(3, ValueType::Datetime, Some(("bigint_01", Encoding::UnixMs))),
    );
    attrs.insert(
        "feedback".to_string(),
        attr(ATTR_FEEDBACK, ValueType::Text, None),
    );
    attrs.insert("score".to_string(), attr(ATTR_SCORE, ValueType::Numeric, None));
    cache.register(VISIT_SCHEMA, VISIT_SCHEMA_ID, attrs);
    Arc::new(cache)
}

pub fn tables() -> StorageTables {
    StorageTables::new("entity_main", "entity_eav")
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        enabled: true,
        max_connections: 2,
        ..EngineConfig::default()
    }
}

/// In-memory cold tier with the entity tables created.
pub async fn cold_client() -> Arc<DuckDbClient> {
    let client = DuckDbClient::open(engine_config()).await.unwrap();
    client
        .execute_batch(ddl::cold_main_table_ddl("entity_main").unwrap())
        .await
        .unwrap();
    client
        .execute_batch(ddl::cold_eav_table_ddl("entity_eav").unwrap())
        .await
        .unwrap();
    Arc::new(client)
}

/// Repository over a pool that never connects; usable wherever the hot
/// tier is not actually touched.
pub fn offline_repo(cache: Arc<MetadataCache>) -> Arc<PostgresRepository> {
    let manager =
        deadpool_postgres::Manager::new(tokio_postgres::Config::new(), tokio_postgres::NoTls);
    let pool = deadpool_postgres::Pool::builder(manager)
        .max_size(1)
        .build()
        .unwrap();
    Arc::new(PostgresRepository::new(pool, cache))
}

pub struct Visit {
    pub row_id: Uuid,
    pub status: &'static str,
    pub lead: Uuid,
    pub visited_at: i64,
    pub feedback: Option<&'static str>,
    pub scores: Vec<f64>,
}

impl Visit {
    pub fn new(status: &'static str, visited_at: i64) -> Self {
        Self {
            row_id: Uuid::new_v4(),
            status,
            lead: Uuid::new_v4(),
            visited_at,
            feedback: None,
            scores: Vec::new(),
        }
    }
}

/// Seed one visit row into the cold tier (main + EAV).
pub async fn seed_visit(client: &DuckDbClient, visit: &Visit) {
    use duckdb::types::Value;

    client
        .execute_sql(
            "INSERT INTO \"entity_main\" (ltbase_schema_id, ltbase_row_id, ltbase_created_at, \
             ltbase_updated_at, text_01, uuid_01, bigint_01) \
             VALUES (?, CAST(? AS UUID), ?, ?, ?, CAST(? AS UUID), ?)"
                .to_string(),
            vec![
                Value::SmallInt(VISIT_SCHEMA_ID),
                Value::Text(visit.row_id.to_string()),
                Value::BigInt(1_000),
                Value::BigInt(1_000),
                Value::Text(visit.status.to_string()),
                Value::Text(visit.lead.to_string()),
                Value::BigInt(visit.visited_at),
            ],
        )
        .await
        .unwrap();

    let mut eav_rows: Vec<(i16, String, Value, Value)> = Vec::new();
    if let Some(feedback) = visit.feedback {
        eav_rows.push((
            ATTR_FEEDBACK,
            String::new(),
            Value::Text(feedback.to_string()),
            Value::Null,
        ));
    }
    for (idx, score) in visit.scores.iter().enumerate() {
        eav_rows.push((
            ATTR_SCORE,
            idx.to_string(),
            Value::Null,
            Value::Double(*score),
        ));
    }

    for (attr_id, indices, value_text, value_numeric) in eav_rows {
        client
            .execute_sql(
                "INSERT INTO \"entity_eav\" (schema_id, row_id, attr_id, array_indices, \
                 value_text, value_numeric) VALUES (?, CAST(? AS UUID), ?, ?, ?, ?)"
                    .to_string(),
                vec![
                    Value::SmallInt(VISIT_SCHEMA_ID),
                    Value::Text(visit.row_id.to_string()),
                    Value::SmallInt(attr_id),
                    Value::Text(indices),
                    value_text,
                    value_numeric,
                ],
            )
            .await
            .unwrap();
    }
}
