use std::sync::Arc;

use crate::errors::StoatDBError;
use crate::metadata::{self, Registry};
use crate::query::quote_ident;

use super::Collection;

/// A handle on one logical database.
#[derive(Debug, Clone)]
pub struct Database {
    registry: Arc<Registry>,
    name: String,
}

/// Aggregated storage statistics over a database's collections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Estimated document count, from the planner's row estimates.
    pub count_documents: i64,
    /// Bytes in the tables' main forks.
    pub size_tables: i64,
    /// Bytes in the tables' free space maps.
    pub size_free: i64,
    /// Bytes in all indexes.
    pub size_indexes: i64,
}

impl Database {
    pub(crate) fn new(registry: Arc<Registry>, name: String) -> Self {
        Self { registry, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn collection(&self, name: impl Into<String>) -> Collection {
        Collection::new(self.registry.clone(), self.name.clone(), name.into())
    }

    /// Metadata snapshots of all collections, sorted by name.
    pub async fn list_collections(
        &self,
    ) -> Result<Vec<Arc<metadata::Collection>>, StoatDBError> {
        self.registry.collection_list(&self.name).await
    }

    /// Creates the collection; `false` means it already existed.
    pub async fn create_collection(&self, name: &str) -> Result<bool, StoatDBError> {
        self.registry.collection_create(&self.name, name).await
    }

    /// Drops the collection; `false` means it did not exist.
    pub async fn drop_collection(&self, name: &str) -> Result<bool, StoatDBError> {
        self.registry.collection_drop(&self.name, name).await
    }

    /// Renames a collection, keeping its table; `false` means the database or
    /// source collection does not exist.
    pub async fn rename_collection(&self, from: &str, to: &str) -> Result<bool, StoatDBError> {
        self.registry.collection_rename(&self.name, from, to).await
    }

    /// Aggregates planner row counts and relation sizes over the database's
    /// collection tables, optionally refreshing the estimates first.
    pub async fn stats(&self, refresh: bool) -> Result<DatabaseStats, StoatDBError> {
        if !self.registry.database_exists(&self.name).await? {
            return Err(StoatDBError::DatabaseDoesNotExist(self.name.clone()));
        }
        let collections = self.registry.collection_list(&self.name).await?;
        if collections.is_empty() {
            return Ok(DatabaseStats::default());
        }
        let tables: Vec<String> = collections.iter().map(|c| c.table_name.clone()).collect();

        let pg = self.registry.pg().await?;
        let client = pg.get().await?;

        if refresh {
            let list: Vec<String> = tables
                .iter()
                .map(|t| format!("{}.{}", quote_ident(&self.name), quote_ident(t)))
                .collect();
            client
                .batch_execute(&format!("ANALYZE {}", list.join(", ")))
                .await?;
        }

        let row = client
            .query_one(
                "SELECT COALESCE(SUM(GREATEST(c.reltuples, 0)), 0)::bigint, \
                 COALESCE(SUM(pg_relation_size(c.oid, 'main')), 0)::bigint, \
                 COALESCE(SUM(pg_relation_size(c.oid, 'fsm')), 0)::bigint, \
                 COALESCE(SUM(pg_indexes_size(c.oid)), 0)::bigint \
                 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = ANY($2)",
                &[&self.name, &tables],
            )
            .await?;

        Ok(DatabaseStats {
            count_documents: row.get(0),
            size_tables: row.get(1),
            size_free: row.get(2),
            size_indexes: row.get(3),
        })
    }
}
