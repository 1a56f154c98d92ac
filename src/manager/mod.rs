//! Entity manager: the thin user-facing layer over registry, transformer
//! and repository.
//!
//! Callers speak JSON entities and schema names; the manager resolves
//! metadata, generates row ids, and applies merge semantics on update
//! (attributes absent from the patch are preserved).

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;
use uuid::Uuid;

use crate::config::StorageTables;
use crate::error::{LtBaseError, Result};
use crate::record::PersistentRecord;
use crate::record::transform::{json_from_record, record_from_json};
use crate::schema::SchemaAttributes;
use crate::storage::postgres::PostgresRepository;

/// One operation of a batch create.
#[derive(Debug, Clone)]
pub struct BatchOp {
    pub schema: String,
    pub entity: JsonValue,
}

/// Outcome of one batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Successful { schema: String, row_id: Uuid },
    Failed { schema: String, code: &'static str, message: String },
}

/// Per-op results of a batch create; one failure never fails the batch.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub outcomes: Vec<BatchOutcome>,
}

impl BatchResult {
    #[must_use]
    pub fn successful(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, BatchOutcome::Successful { .. }))
            .count()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.successful()
    }
}

/// CRUD over JSON entities.
pub struct EntityManager {
    repo: Arc<PostgresRepository>,
    tables: StorageTables,
}

impl EntityManager {
    #[must_use]
    pub fn new(repo: Arc<PostgresRepository>, tables: StorageTables) -> Self {
        Self { repo, tables }
    }

    fn resolve(&self, schema: &str) -> Result<(i16, Arc<SchemaAttributes>)> {
        let cache = self.repo.cache();
        let schema_id = cache
            .schema_id(schema)
            .ok_or_else(|| LtBaseError::SchemaNotFound {
                schema: schema.to_string(),
            })?;
        let attrs = cache
            .attributes(schema)
            .ok_or_else(|| LtBaseError::SchemaNotFound {
                schema: schema.to_string(),
            })?;
        Ok((schema_id, attrs))
    }

    /// Create an entity; returns the generated row id.
    pub async fn create(&self, schema: &str, entity: &JsonValue) -> Result<Uuid> {
        let (schema_id, attrs) = self.resolve(schema)?;
        let row_id = Uuid::new_v4();
        let mut record = record_from_json(schema_id, row_id, entity, &attrs)?;
        self.repo.insert(&self.tables, &mut record).await?;
        debug!(schema = %schema, row_id = %row_id, "entity created");
        Ok(row_id)
    }

    /// Update an entity with merge semantics: attributes present in the
    /// patch replace stored values; everything else is preserved.
    pub async fn update(&self, schema: &str, row_id: Uuid, patch: &JsonValue) -> Result<()> {
        let (schema_id, attrs) = self.resolve(schema)?;
        let existing = self
            .repo
            .get(&self.tables, schema_id, row_id)
            .await?
            .ok_or(LtBaseError::RowNotFound { schema_id, row_id })?;

        let incoming = record_from_json(schema_id, row_id, patch, &attrs)?;

        let mut merged = existing;
        merged.text.extend(incoming.text);
        merged.int16.extend(incoming.int16);
        merged.int32.extend(incoming.int32);
        merged.int64.extend(incoming.int64);
        merged.float64.extend(incoming.float64);
        merged.uuid.extend(incoming.uuid);

        // EAV: patched attributes fully replace their stored rows.
        let patched: std::collections::HashSet<i16> = incoming
            .other_attributes
            .iter()
            .map(|row| row.attr_id)
            .collect();
        merged
            .other_attributes
            .retain(|row| !patched.contains(&row.attr_id));
        merged.other_attributes.extend(incoming.other_attributes);
        merged.normalize();

        self.repo.update(&self.tables, &mut merged).await
    }

    /// Hard-delete an entity; returns whether it existed.
    pub async fn delete(&self, schema: &str, row_id: Uuid) -> Result<bool> {
        let (schema_id, _) = self.resolve(schema)?;
        self.repo.delete(&self.tables, schema_id, row_id).await
    }

    /// Read an entity back as its logical JSON view.
    pub async fn get(&self, schema: &str, row_id: Uuid) -> Result<Option<JsonValue>> {
        let (schema_id, attrs) = self.resolve(schema)?;
        let Some(record) = self.repo.get(&self.tables, schema_id, row_id).await? else {
            return Ok(None);
        };
        Ok(Some(json_from_record(&record, &attrs)?))
    }

    /// Read the stored record shape.
    pub async fn get_record(
        &self,
        schema: &str,
        row_id: Uuid,
    ) -> Result<Option<PersistentRecord>> {
        let (schema_id, _) = self.resolve(schema)?;
        self.repo.get(&self.tables, schema_id, row_id).await
    }

    /// Create many entities; each op succeeds or fails on its own.
    pub async fn batch_create(&self, ops: &[BatchOp]) -> BatchResult {
        let mut result = BatchResult::default();
        for op in ops {
            match self.create(&op.schema, &op.entity).await {
                Ok(row_id) => result.outcomes.push(BatchOutcome::Successful {
                    schema: op.schema.clone(),
                    row_id,
                }),
                Err(error) => result.outcomes.push(BatchOutcome::Failed {
                    schema: op.schema.clone(),
                    code: "CREATE_FAILED",
                    message: error.to_string(),
                }),
            }
        }
        result
    }
}
