//! Registry of tenant-filtered tables and a cached view of their columns.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::catalog::SchemaCatalog;
use crate::error::SchemaLookupError;

/// A model whose rows are subject to workspace isolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilteredModule {
    /// Physical table name.
    pub table: String,

    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Type identifier stored in `model_type` columns of the link tables.
    pub entity_type: String,
}

fn default_primary_key() -> String {
    "id".to_owned()
}

impl FilteredModule {
    #[must_use]
    pub fn new(table: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            primary_key: default_primary_key(),
            entity_type: entity_type.into(),
        }
    }

    #[must_use]
    pub fn with_primary_key(mut self, primary_key: impl Into<String>) -> Self {
        self.primary_key = primary_key.into();
        self
    }
}

/// Filtered modules keyed by table, plus column metadata cached per process.
///
/// Column lists are fetched once per table and reused; a failed lookup is not
/// cached so that a later call may succeed.
pub struct SchemaRegistry {
    modules: HashMap<String, FilteredModule>,
    columns: DashMap<String, Arc<Vec<String>>>,
    catalog: Arc<dyn SchemaCatalog>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("modules", &self.modules)
            .field("cached_tables", &self.columns.len())
            .finish_non_exhaustive()
    }
}

impl SchemaRegistry {
    #[must_use]
    pub fn new<I>(modules: I, catalog: Arc<dyn SchemaCatalog>) -> Self
    where
        I: IntoIterator<Item = FilteredModule>,
    {
        Self {
            modules: modules
                .into_iter()
                .map(|m| (m.table.clone(), m))
                .collect(),
            columns: DashMap::new(),
            catalog,
        }
    }

    #[must_use]
    pub fn module(&self, table: &str) -> Option<&FilteredModule> {
        self.modules.get(table)
    }

    #[must_use]
    pub fn is_filtered(&self, table: &str) -> bool {
        self.modules.contains_key(table)
    }

    pub fn modules(&self) -> impl Iterator<Item = &FilteredModule> {
        self.modules.values()
    }

    /// Primary key column of a filtered table, `id` for anything else.
    #[must_use]
    pub fn primary_key(&self, table: &str) -> &str {
        self.modules
            .get(table)
            .map_or("id", |m| m.primary_key.as_str())
    }

    /// Columns of `table`, served from cache after the first lookup.
    ///
    /// # Errors
    /// Propagates the catalog's `SchemaLookupError`.
    pub async fn columns(&self, table: &str) -> Result<Arc<Vec<String>>, SchemaLookupError> {
        if let Some(hit) = self.columns.get(table) {
            return Ok(Arc::clone(hit.value()));
        }
        let fetched = Arc::new(self.catalog.list_columns(table).await?);
        tracing::trace!(table, count = fetched.len(), "cached table columns");
        self.columns.insert(table.to_owned(), Arc::clone(&fetched));
        Ok(fetched)
    }

    /// Drop cached columns, e.g. after a schema change.
    pub fn invalidate(&self, table: &str) {
        self.columns.remove(table);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::catalog::StaticCatalog;

    #[tokio::test]
    async fn test_registry_lookups() {
        let catalog = StaticCatalog::new().with_table("posts", ["id", "title"]);
        let registry = SchemaRegistry::new(
            [FilteredModule::new("posts", "post").with_primary_key("post_id")],
            Arc::new(catalog),
        );

        assert!(registry.is_filtered("posts"));
        assert!(!registry.is_filtered("users"));
        assert_eq!(registry.primary_key("posts"), "post_id");
        assert_eq!(registry.primary_key("users"), "id");
        assert_eq!(registry.columns("posts").await.unwrap().len(), 2);
        assert!(registry.columns("users").await.is_err());
    }

    #[test]
    fn test_filtered_module_deserialize_defaults_primary_key() {
        let m: FilteredModule =
            serde_json::from_value(serde_json::json!({"table": "posts", "entity_type": "post"}))
                .unwrap();
        assert_eq!(m.primary_key, "id");
    }
}
