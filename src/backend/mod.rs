//! The public backend façades consumed by the command layer: a [`Backend`]
//! hands out [`Database`] handles, which hand out [`Collection`] handles.
//! Every operation takes a typed parameters value and returns a typed result.

mod collection;
mod database;

pub use collection::{Collection, CollectionStats, ExplainResult, QueryParams, QueryResult};
pub use database::{Database, DatabaseStats};

use std::sync::Arc;

use crate::errors::StoatDBError;
use crate::metadata::Registry;
use crate::pool::PgPool;

/// One authenticated backend handle; the registry it owns is shared by all
/// databases and collections derived from it.
#[derive(Debug, Clone)]
pub struct Backend {
    registry: Arc<Registry>,
}

impl Backend {
    pub fn new(
        pool: Arc<PgPool>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, StoatDBError> {
        Ok(Self {
            registry: Arc::new(Registry::new(pool, username, password)?),
        })
    }

    /// The registry, for metric registration and tests.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn database(&self, name: impl Into<String>) -> Database {
        Database::new(self.registry.clone(), name.into())
    }

    pub async fn list_databases(&self) -> Result<Vec<String>, StoatDBError> {
        self.registry.database_list().await
    }

    pub async fn drop_database(&self, name: &str) -> Result<bool, StoatDBError> {
        self.registry.database_drop(name).await
    }
}
