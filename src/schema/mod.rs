//! Schema and attribute metadata cache.
//!
//! Maps schema names to ids and holds per-schema attribute descriptors.
//! Population is a one-shot [`MetadataCache::load`] that reads the registry
//! table and scans a directory of `<name>_attributes.json` files; lookups
//! take the shared lock only.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio_postgres::GenericClient;
use tracing::{debug, warn};

use crate::error::{LtBaseError, Result};
use crate::util::sanitize;

/// Logical value type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Text,
    Uuid,
    Numeric,
    Smallint,
    Integer,
    Bigint,
    Bool,
    Date,
    Datetime,
}

impl ValueType {
    /// Whether values of this type live in `value_text` (vs `value_numeric`).
    #[must_use]
    pub const fn is_textual(self) -> bool {
        matches!(self, Self::Text | Self::Uuid)
    }
}

/// How a bound value is encoded into its main column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    #[default]
    Default,
    UnixMs,
    BoolInt,
    BoolText,
    Iso8601,
}

/// Binding of an attribute to a main-table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnBinding {
    pub column_name: String,
    #[serde(default)]
    pub encoding: Encoding,
}

/// Per-attribute descriptor. Presence of `column_binding` means the
/// attribute lives in the main table; absence means EAV. The storage
/// location is fixed for the life of a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeMetadata {
    #[serde(rename = "id")]
    pub attribute_id: i16,
    pub value_type: ValueType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_binding: Option<ColumnBinding>,
}

/// Attribute descriptors of one schema, indexed by name and by id.
#[derive(Debug, Default)]
pub struct SchemaAttributes {
    by_name: HashMap<String, AttributeMetadata>,
    names_by_id: HashMap<i16, String>,
}

impl SchemaAttributes {
    #[must_use]
    pub fn new(attrs: HashMap<String, AttributeMetadata>) -> Self {
        let names_by_id = attrs
            .iter()
            .map(|(name, meta)| (meta.attribute_id, name.clone()))
            .collect();
        Self {
            by_name: attrs,
            names_by_id,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttributeMetadata> {
        self.by_name.get(name)
    }

    #[must_use]
    pub fn name_of(&self, attr_id: i16) -> Option<&str> {
        self.names_by_id.get(&attr_id).map(String::as_str)
    }

    #[must_use]
    pub fn get_by_id(&self, attr_id: i16) -> Option<&AttributeMetadata> {
        self.name_of(attr_id).and_then(|name| self.by_name.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeMetadata)> {
        self.by_name.iter().map(|(name, meta)| (name.as_str(), meta))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[derive(Default)]
struct CacheInner {
    name_to_id: HashMap<String, i16>,
    id_to_name: HashMap<i16, String>,
    attributes: HashMap<String, Arc<SchemaAttributes>>,
}

/// Reader-writer-locked schema metadata cache.
#[derive(Default)]
pub struct MetadataCache {
    inner: RwLock<CacheInner>,
}

impl MetadataCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot population: read `(schema_name, schema_id)` pairs from the
    /// registry table, then scan `attributes_dir` for
    /// `<name>_attributes.json` files. A registry entry without a matching
    /// file is allowed (the schema is usable for main columns only); a file
    /// without a registry entry is skipped. Both cases warn.
    pub async fn load<C>(
        &self,
        client: &C,
        registry_table: &str,
        attributes_dir: &Path,
    ) -> Result<()>
    where
        C: GenericClient + Sync,
    {
        let registry = sanitize(registry_table);
        if registry.is_empty() {
            return Err(LtBaseError::EmptyTableName {
                context: "schema registry",
            });
        }

        let rows = client
            .query(
                &format!("SELECT schema_name, schema_id FROM {registry}"),
                &[],
            )
            .await
            .map_err(LtBaseError::driver("read schema registry"))?;

        let mut name_to_id = HashMap::with_capacity(rows.len());
        let mut id_to_name = HashMap::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.get(0);
            let id: i16 = row.get(1);
            name_to_id.insert(name.clone(), id);
            id_to_name.insert(id, name);
        }

        let mut attributes = HashMap::new();
        for (name, attrs) in scan_attribute_dir(attributes_dir, &name_to_id)? {
            attributes.insert(name, Arc::new(attrs));
        }

        for name in name_to_id.keys() {
            if !attributes.contains_key(name) {
                warn!(schema = %name, "no attribute file found, schema usable for main columns only");
            }
        }

        debug!(
            schemas = name_to_id.len(),
            attribute_files = attributes.len(),
            "metadata cache loaded"
        );

        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.name_to_id = name_to_id;
        inner.id_to_name = id_to_name;
        inner.attributes = attributes;
        Ok(())
    }

    /// Register a schema directly. Wiring convenience for embedders and
    /// tests; `load` is the production path.
    pub fn register(
        &self,
        name: &str,
        schema_id: i16,
        attrs: HashMap<String, AttributeMetadata>,
    ) {
        let mut inner = self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.name_to_id.insert(name.to_string(), schema_id);
        inner.id_to_name.insert(schema_id, name.to_string());
        inner
            .attributes
            .insert(name.to_string(), Arc::new(SchemaAttributes::new(attrs)));
    }

    #[must_use]
    pub fn schema_id(&self, name: &str) -> Option<i16> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.name_to_id.get(name).copied()
    }

    #[must_use]
    pub fn schema_name(&self, schema_id: i16) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.id_to_name.get(&schema_id).cloned()
    }

    /// Attribute descriptors for a schema, or `None` when the schema has no
    /// attribute file loaded.
    #[must_use]
    pub fn attributes(&self, schema_name: &str) -> Option<Arc<SchemaAttributes>> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.attributes.get(schema_name).cloned()
    }

    /// Attribute descriptors looked up by schema id.
    #[must_use]
    pub fn attributes_by_id(&self, schema_id: i16) -> Option<Arc<SchemaAttributes>> {
        let inner = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let name = inner.id_to_name.get(&schema_id)?;
        inner.attributes.get(name).cloned()
    }
}

const ATTRIBUTE_FILE_SUFFIX: &str = "_attributes.json";

/// Scan a directory for attribute files and parse the ones whose schema is
/// registered. Returns `(schema_name, attributes)` pairs.
fn scan_attribute_dir(
    dir: &Path,
    registered: &HashMap<String, i16>,
) -> Result<Vec<(String, SchemaAttributes)>> {
    let mut out = Vec::new();
    if !dir.is_dir() {
        warn!(dir = %dir.display(), "attribute directory missing, no attribute metadata loaded");
        return Ok(out);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(schema_name) = file_name.strip_suffix(ATTRIBUTE_FILE_SUFFIX) else {
            continue;
        };

        if !registered.contains_key(schema_name) {
            warn!(schema = %schema_name, file = %file_name, "attribute file has no registry entry, skipping");
            continue;
        }

        let contents = std::fs::read_to_string(entry.path())?;
        let parsed: HashMap<String, AttributeMetadata> = serde_json::from_str(&contents)?;
        out.push((schema_name.to_string(), SchemaAttributes::new(parsed)));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: i16, value_type: ValueType, binding: Option<(&str, Encoding)>) -> AttributeMetadata {
        AttributeMetadata {
            attribute_id: id,
            value_type,
            column_binding: binding.map(|(col, encoding)| ColumnBinding {
                column_name: col.to_string(),
                encoding,
            }),
        }
    }

    #[test]
    fn register_and_lookup() {
        let cache = MetadataCache::new();
        let mut attrs = HashMap::new();
        attrs.insert("status".to_string(), meta(1, ValueType::Text, Some(("text_01", Encoding::Default))));
        attrs.insert("feedback".to_string(), meta(2, ValueType::Text, None));
        cache.register("visit", 7, attrs);

        assert_eq!(cache.schema_id("visit"), Some(7));
        assert_eq!(cache.schema_name(7).as_deref(), Some("visit"));
        assert_eq!(cache.schema_id("missing"), None);

        let attrs = cache.attributes("visit").unwrap();
        assert_eq!(attrs.get("status").unwrap().attribute_id, 1);
        assert_eq!(attrs.name_of(2), Some("feedback"));
        assert!(attrs.get_by_id(2).unwrap().column_binding.is_none());
    }

    #[test]
    fn attribute_file_parses_with_unknown_keys() {
        let json = r#"{
            "status": {"id": 1, "value_type": "text",
                       "column_binding": {"column_name": "text_01", "encoding": "default"},
                       "display_name": "Status"},
            "visited_at": {"id": 2, "value_type": "datetime",
                           "column_binding": {"column_name": "bigint_01", "encoding": "unix_ms"}},
            "feedback": {"id": 3, "value_type": "text"}
        }"#;
        let parsed: HashMap<String, AttributeMetadata> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(
            parsed["visited_at"].column_binding.as_ref().unwrap().encoding,
            Encoding::UnixMs
        );
        assert!(parsed["feedback"].column_binding.is_none());
    }

    #[test]
    fn scan_skips_unregistered_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("visit_attributes.json"),
            r#"{"status": {"id": 1, "value_type": "text"}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("orphan_attributes.json"),
            r#"{"x": {"id": 1, "value_type": "text"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let mut registered = HashMap::new();
        registered.insert("visit".to_string(), 1i16);

        let loaded = scan_attribute_dir(dir.path(), &registered).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "visit");
    }

    #[test]
    fn scan_missing_dir_is_empty() {
        let loaded =
            scan_attribute_dir(Path::new("/nonexistent/ltbase-attrs"), &HashMap::new()).unwrap();
        assert!(loaded.is_empty());
    }
}
