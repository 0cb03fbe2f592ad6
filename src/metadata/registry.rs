//! The in-memory registry and its persisted mirror table.
//!
//! A single read-write lock guards the whole map and serialises all DDL; the
//! SQL mutation and the in-memory mutation happen in the same critical
//! section. Installed [`Collection`] values are immutable; every mutation
//! replaces the `Arc`, so readers holding a snapshot never observe changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use deadpool_postgres::{Object, Pool};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{IntGauge, Opts};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::StoatDBError;
use crate::pool::PgPool;
use crate::query::quote_ident;
use crate::sjson;
use crate::types::Value;

use super::names::{self, DEFAULT_INDEX, METADATA_TABLE};
use super::{Collection, IndexInfo, IndexKeyPair, IndexRequest};

type CollectionMap = HashMap<String, HashMap<String, Arc<Collection>>>;

/// The authoritative map of databases → collections, lazily loaded from the
/// per-database metadata tables.
pub struct Registry {
    pool: Arc<PgPool>,
    username: String,
    password: String,
    colls: RwLock<Option<CollectionMap>>,
    databases_gauge: IntGauge,
    collections_gauge: IntGauge,
}

impl Registry {
    pub fn new(
        pool: Arc<PgPool>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, StoatDBError> {
        let databases_gauge = IntGauge::with_opts(Opts::new(
            "ferretdb_postgresql_metadata_databases",
            "The current number of databases in the registry.",
        ))?;
        let collections_gauge = IntGauge::with_opts(Opts::new(
            "ferretdb_postgresql_metadata_collections",
            "The current number of collections in the registry.",
        ))?;
        Ok(Self {
            pool,
            username: username.into(),
            password: password.into(),
            colls: RwLock::new(None),
            databases_gauge,
            collections_gauge,
        })
    }

    /// Acquires the backend pool, authenticating the stored credentials.
    /// Every public method goes through here before touching the map.
    pub(crate) async fn pg(&self) -> Result<Pool, StoatDBError> {
        self.pool.get(&self.username, &self.password).await
    }

    async fn ensure_loaded(&self, pg: &Pool) -> Result<(), StoatDBError> {
        if self.colls.read().await.is_some() {
            return Ok(());
        }
        let mut guard = self.colls.write().await;
        if guard.is_none() {
            let loaded = load_metadata(pg).await?;
            self.update_gauges(&loaded);
            *guard = Some(loaded);
        }
        Ok(())
    }

    fn update_gauges(&self, map: &CollectionMap) {
        self.databases_gauge.set(map.len() as i64);
        self.collections_gauge
            .set(map.values().map(|c| c.len() as i64).sum());
    }

    /// Sorted logical database names.
    pub async fn database_list(&self) -> Result<Vec<String>, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;

        let guard = self.colls.read().await;
        let mut list: Vec<String> = guard
            .as_ref()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        list.sort_unstable();
        Ok(list)
    }

    /// Whether the database is known to the registry.
    pub async fn database_exists(&self, db: &str) -> Result<bool, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;

        let guard = self.colls.read().await;
        Ok(guard.as_ref().is_some_and(|m| m.contains_key(db)))
    }

    /// Drops the database schema and forgets its collections.
    pub async fn database_drop(&self, db: &str) -> Result<bool, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;
        let client = pg.get().await?;

        let mut guard = self.colls.write().await;
        let map = guard.get_or_insert_with(CollectionMap::new);
        if !map.contains_key(db) {
            return Ok(false);
        }

        client
            .execute(&format!("DROP SCHEMA {} CASCADE", quote_ident(db)), &[])
            .await?;

        map.remove(db);
        self.update_gauges(map);
        debug!(db, "dropped database");
        Ok(true)
    }

    /// Sorted metadata snapshots of the database's collections.
    pub async fn collection_list(&self, db: &str) -> Result<Vec<Arc<Collection>>, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;

        let guard = self.colls.read().await;
        let mut list: Vec<Arc<Collection>> = guard
            .as_ref()
            .and_then(|m| m.get(db))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        list.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        Ok(list)
    }

    /// An immutable snapshot of one collection's metadata, if it exists.
    pub async fn collection_get(
        &self,
        db: &str,
        coll: &str,
    ) -> Result<Option<Arc<Collection>>, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;

        let guard = self.colls.read().await;
        Ok(guard
            .as_ref()
            .and_then(|m| m.get(db))
            .and_then(|m| m.get(coll))
            .cloned())
    }

    /// Creates the collection (and its database when needed); returns `false`
    /// without touching anything if it already exists.
    pub async fn collection_create(&self, db: &str, coll: &str) -> Result<bool, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;
        let client = pg.get().await?;

        let mut guard = self.colls.write().await;
        let map = guard.get_or_insert_with(CollectionMap::new);

        if map.get(db).is_some_and(|m| m.contains_key(coll)) {
            return Ok(false);
        }
        if !map.contains_key(db) {
            create_database(&client, db).await?;
            map.insert(db.to_string(), HashMap::new());
            debug!(db, "created database");
        }

        let taken_tables: HashSet<String> = map
            .get(db)
            .into_iter()
            .flat_map(|m| m.values().map(|c| c.table_name.clone()))
            .collect();
        let taken_pg_indexes = pg_index_names(map, db);

        let mut seed = 0u32;
        let table_name = loop {
            let t = names::table_name(coll, seed);
            if !taken_tables.contains(&t) {
                break t;
            }
            seed += 1;
        };

        client
            .execute(
                &format!(
                    "CREATE TABLE {}.{} (_jsonb jsonb)",
                    quote_ident(db),
                    quote_ident(&table_name)
                ),
                &[],
            )
            .await?;

        let mut collection = Collection {
            name: coll.to_string(),
            table_name: table_name.clone(),
            indexes: Vec::new(),
        };

        if let Err(err) =
            setup_new_collection(&client, db, &mut collection, &taken_pg_indexes).await
        {
            let drop_sql = format!(
                "DROP TABLE IF EXISTS {}.{} CASCADE",
                quote_ident(db),
                quote_ident(&table_name)
            );
            if let Err(drop_err) = client.execute(&drop_sql, &[]).await {
                warn!(db, coll, %drop_err, "failed to drop transient table after create failure");
            }
            return Err(err);
        }

        if let Some(m) = map.get_mut(db) {
            m.insert(coll.to_string(), Arc::new(collection));
        }
        self.update_gauges(map);
        debug!(db, coll, table = %table_name, "created collection");
        Ok(true)
    }

    /// Drops the collection table and its metadata row; returns `false` if the
    /// collection does not exist.
    ///
    /// The table drop comes first: on partial failure the data is gone and at
    /// most the metadata row is stale, which is logged rather than repaired.
    pub async fn collection_drop(&self, db: &str, coll: &str) -> Result<bool, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;
        let client = pg.get().await?;

        let mut guard = self.colls.write().await;
        let map = guard.get_or_insert_with(CollectionMap::new);
        let collection = match map.get(db).and_then(|m| m.get(coll)) {
            Some(c) => c.clone(),
            None => return Ok(false),
        };

        client
            .execute(
                &format!(
                    "DROP TABLE {}.{} CASCADE",
                    quote_ident(db),
                    quote_ident(&collection.table_name)
                ),
                &[],
            )
            .await?;

        let id = sjson::single_value_json(&Value::String(coll.to_string()));
        let delete_sql = format!(
            "DELETE FROM {}.{} WHERE _jsonb->'_id' = $1",
            quote_ident(db),
            quote_ident(METADATA_TABLE)
        );
        if let Err(err) = client.execute(&delete_sql, &[&id]).await {
            warn!(db, coll, %err, "failed to delete metadata row after table drop");
        }

        if let Some(m) = map.get_mut(db) {
            m.remove(coll);
        }
        self.update_gauges(map);
        debug!(db, coll, "dropped collection");
        Ok(true)
    }

    /// Renames a collection, keeping its table name unchanged. Returns `false`
    /// if the database or the source collection does not exist.
    pub async fn collection_rename(
        &self,
        db: &str,
        from: &str,
        to: &str,
    ) -> Result<bool, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;
        let client = pg.get().await?;

        let mut guard = self.colls.write().await;
        let map = guard.get_or_insert_with(CollectionMap::new);
        let db_map = match map.get_mut(db) {
            Some(m) => m,
            None => return Ok(false),
        };
        let current = match db_map.get(from) {
            Some(c) => c.clone(),
            None => return Ok(false),
        };
        if db_map.contains_key(to) {
            return Err(StoatDBError::CollectionAlreadyExists(to.to_string()));
        }

        let mut renamed = (*current).clone();
        renamed.name = to.to_string();

        let row = sjson::marshal_json(&renamed.to_document());
        let id = sjson::single_value_json(&Value::String(from.to_string()));
        client
            .execute(
                &format!(
                    "UPDATE {}.{} SET _jsonb = $1 WHERE _jsonb->'_id' = $2",
                    quote_ident(db),
                    quote_ident(METADATA_TABLE)
                ),
                &[&row, &id],
            )
            .await?;

        db_map.remove(from);
        db_map.insert(to.to_string(), Arc::new(renamed));
        debug!(db, from, to, "renamed collection");
        Ok(true)
    }

    /// Creates the requested indexes, skipping names that already exist on the
    /// collection. Returns how many were created. A failure rolls back only
    /// the indexes created by this call.
    pub async fn indexes_create(
        &self,
        db: &str,
        coll: &str,
        requests: &[IndexRequest],
    ) -> Result<usize, StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;
        let client = pg.get().await?;

        let mut guard = self.colls.write().await;
        let map = guard.get_or_insert_with(CollectionMap::new);
        let collection = map
            .get(db)
            .and_then(|m| m.get(coll))
            .cloned()
            .ok_or_else(|| StoatDBError::CollectionDoesNotExist(coll.to_string()))?;

        let taken_pg_indexes = pg_index_names(map, db);
        let mut updated = (*collection).clone();
        let created =
            create_indexes_on(&client, db, &taken_pg_indexes, &mut updated, requests).await?;

        if created > 0 {
            if let Err(err) = persist_collection(&client, db, &updated).await {
                let rollback: Vec<String> = updated.indexes[updated.indexes.len() - created..]
                    .iter()
                    .map(|i| i.pg_index.clone())
                    .collect();
                drop_pg_indexes(&client, db, &rollback).await;
                return Err(err);
            }
            if let Some(slot) = map.get_mut(db).and_then(|m| m.get_mut(coll)) {
                *slot = Arc::new(updated);
            }
        }
        Ok(created)
    }

    /// Drops the named indexes where they exist and persists the result.
    pub async fn indexes_drop(
        &self,
        db: &str,
        coll: &str,
        index_names: &[String],
    ) -> Result<(), StoatDBError> {
        let pg = self.pg().await?;
        self.ensure_loaded(&pg).await?;
        let client = pg.get().await?;

        let mut guard = self.colls.write().await;
        let map = guard.get_or_insert_with(CollectionMap::new);
        let collection = map
            .get(db)
            .and_then(|m| m.get(coll))
            .cloned()
            .ok_or_else(|| StoatDBError::CollectionDoesNotExist(coll.to_string()))?;

        let mut updated = (*collection).clone();
        let mut dropped = 0usize;
        for name in index_names {
            let pos = match updated.indexes.iter().position(|i| &i.name == name) {
                Some(pos) => pos,
                None => continue,
            };
            let pg_index = updated.indexes[pos].pg_index.clone();
            let drop_sql = format!(
                "DROP INDEX {}.{}",
                quote_ident(db),
                quote_ident(&pg_index)
            );
            if let Err(err) = client.execute(&drop_sql, &[]).await {
                // Keep memory and the mirror row as close to SQL truth as the
                // partial drop allows before surfacing the error.
                if dropped > 0 {
                    if let Err(persist_err) = persist_collection(&client, db, &updated).await {
                        warn!(db, coll, %persist_err, "failed to persist metadata after partial index drop");
                    }
                    if let Some(slot) = map.get_mut(db).and_then(|m| m.get_mut(coll)) {
                        *slot = Arc::new(updated);
                    }
                }
                return Err(err.into());
            }
            updated.indexes.remove(pos);
            dropped += 1;
        }

        if dropped > 0 {
            persist_collection(&client, db, &updated).await?;
            if let Some(slot) = map.get_mut(db).and_then(|m| m.get_mut(coll)) {
                *slot = Arc::new(updated);
            }
        }
        Ok(())
    }
}

impl Collector for Registry {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = self.databases_gauge.desc();
        descs.extend(self.collections_gauge.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let mut families = self.databases_gauge.collect();
        families.extend(self.collections_gauge.collect());
        families
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// All backend index names in use across the database.
fn pg_index_names(map: &CollectionMap, db: &str) -> HashSet<String> {
    map.get(db)
        .into_iter()
        .flat_map(|m| m.values())
        .flat_map(|c| c.indexes.iter().map(|i| i.pg_index.clone()))
        .collect()
}

async fn load_metadata(pg: &Pool) -> Result<CollectionMap, StoatDBError> {
    let client = pg.get().await?;
    let schemas = client
        .query(
            "SELECT schema_name FROM information_schema.schemata \
             WHERE schema_name NOT LIKE 'pg\\_%' AND schema_name <> 'information_schema'",
            &[],
        )
        .await?;

    let mut map = CollectionMap::new();
    for row in schemas {
        let schema: String = row.get(0);

        // A schema without the metadata table is not a database.
        let has_metadata: bool = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2)",
                &[&schema, &METADATA_TABLE],
            )
            .await?
            .get(0);
        if !has_metadata {
            continue;
        }

        let rows = client
            .query(
                &format!(
                    "SELECT _jsonb FROM {}.{}",
                    quote_ident(&schema),
                    quote_ident(METADATA_TABLE)
                ),
                &[],
            )
            .await?;

        let mut colls = HashMap::with_capacity(rows.len());
        for row in rows {
            let json: serde_json::Value = row.get(0);
            let coll = Collection::from_document(&sjson::unmarshal_json(json)?)?;
            colls.insert(coll.name.clone(), Arc::new(coll));
        }
        map.insert(schema, colls);
    }

    debug!(databases = map.len(), "loaded metadata");
    Ok(map)
}

/// Creates the schema, the metadata table and its two unique indexes. On any
/// step failure the schema is dropped again and the original error returned.
async fn create_database(client: &Object, db: &str) -> Result<(), StoatDBError> {
    if let Err(err) = create_database_steps(client, db).await {
        let drop_sql = format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(db));
        if let Err(drop_err) = client.execute(&drop_sql, &[]).await {
            warn!(db, %drop_err, "failed to drop schema after create failure");
        }
        return Err(err);
    }
    Ok(())
}

async fn create_database_steps(client: &Object, db: &str) -> Result<(), StoatDBError> {
    let qdb = quote_ident(db);
    let qmeta = quote_ident(METADATA_TABLE);

    client
        .execute(&format!("CREATE SCHEMA {}", qdb), &[])
        .await?;
    client
        .execute(&format!("CREATE TABLE {}.{} (_jsonb jsonb)", qdb, qmeta), &[])
        .await?;
    client
        .execute(
            &format!(
                "CREATE UNIQUE INDEX {} ON {}.{} ((_jsonb->'_id'))",
                quote_ident(&format!("{}_id_idx", METADATA_TABLE)),
                qdb,
                qmeta
            ),
            &[],
        )
        .await?;
    client
        .execute(
            &format!(
                "CREATE UNIQUE INDEX {} ON {}.{} ((_jsonb->'table'))",
                quote_ident(&format!("{}_table_idx", METADATA_TABLE)),
                qdb,
                qmeta
            ),
            &[],
        )
        .await?;
    Ok(())
}

/// Inserts the metadata row and creates the default `_id_` index for a table
/// that was just created.
async fn setup_new_collection(
    client: &Object,
    db: &str,
    collection: &mut Collection,
    taken_pg_indexes: &HashSet<String>,
) -> Result<(), StoatDBError> {
    let row = sjson::marshal_json(&collection.to_document());
    client
        .execute(
            &format!(
                "INSERT INTO {}.{} (_jsonb) VALUES ($1)",
                quote_ident(db),
                quote_ident(METADATA_TABLE)
            ),
            &[&row],
        )
        .await?;

    let default_index = IndexRequest {
        name: DEFAULT_INDEX.to_string(),
        key: vec![IndexKeyPair {
            field: "_id".to_string(),
            descending: false,
        }],
        unique: true,
    };
    create_indexes_on(client, db, taken_pg_indexes, collection, &[default_index]).await?;
    persist_collection(client, db, collection).await?;
    Ok(())
}

/// Creates the requested indexes on the collection table, appending their
/// metadata to `collection`. On failure, indexes created by this call are
/// dropped again and `collection` is left unchanged.
async fn create_indexes_on(
    client: &Object,
    db: &str,
    taken_pg_indexes: &HashSet<String>,
    collection: &mut Collection,
    requests: &[IndexRequest],
) -> Result<usize, StoatDBError> {
    let initial_len = collection.indexes.len();
    let mut taken: HashSet<String> = taken_pg_indexes.clone();
    taken.extend(collection.indexes.iter().map(|i| i.pg_index.clone()));

    let mut created: Vec<String> = Vec::new();
    for request in requests {
        if let Some(existing) = collection.indexes.iter().find(|i| i.name == request.name) {
            // The same definition again is a no-op; the same name with a
            // different definition is a conflict.
            if existing.key == request.key && existing.unique == request.unique {
                continue;
            }
            drop_pg_indexes(client, db, &created).await;
            collection.indexes.truncate(initial_len);
            return Err(StoatDBError::IndexAlreadyExists(request.name.clone()));
        }

        let mut seed = 0u32;
        let pg_index = loop {
            let candidate = names::pg_index_name(&collection.name, &request.name, seed);
            if !taken.contains(&candidate) {
                break candidate;
            }
            seed += 1;
        };

        let columns: Vec<String> = request.key.iter().map(index_column).collect();
        let sql = format!(
            "CREATE {}INDEX {} ON {}.{} ({})",
            if request.unique { "UNIQUE " } else { "" },
            quote_ident(&pg_index),
            quote_ident(db),
            quote_ident(&collection.table_name),
            columns.join(", ")
        );
        if let Err(err) = client.execute(&sql, &[]).await {
            drop_pg_indexes(client, db, &created).await;
            collection.indexes.truncate(initial_len);
            return Err(StoatDBError::from_pg(err));
        }

        taken.insert(pg_index.clone());
        created.push(pg_index.clone());
        collection.indexes.push(IndexInfo {
            name: request.name.clone(),
            pg_index,
            key: request.key.clone(),
            unique: request.unique,
        });
    }
    Ok(created.len())
}

/// Best-effort removal of backend indexes, used on rollback paths.
async fn drop_pg_indexes(client: &Object, db: &str, pg_indexes: &[String]) {
    for pg_index in pg_indexes {
        let sql = format!(
            "DROP INDEX IF EXISTS {}.{}",
            quote_ident(db),
            quote_ident(pg_index)
        );
        if let Err(err) = client.execute(&sql, &[]).await {
            warn!(db, index = %pg_index, %err, "failed to roll back index");
        }
    }
}

/// One column of an index definition: a chained `->` path expression, with
/// `DESC` for descending keys.
fn index_column(pair: &IndexKeyPair) -> String {
    let path: Vec<String> = pair
        .field
        .split('.')
        .map(|part| format!("'{}'", part.replace('\'', "''")))
        .collect();
    let mut column = format!("((_jsonb -> {}))", path.join(" -> "));
    if pair.descending {
        column.push_str(" DESC");
    }
    column
}

/// Rewrites the collection's metadata row in place.
async fn persist_collection(
    client: &Object,
    db: &str,
    collection: &Collection,
) -> Result<(), StoatDBError> {
    let row = sjson::marshal_json(&collection.to_document());
    let id = sjson::single_value_json(&Value::String(collection.name.clone()));
    client
        .execute(
            &format!(
                "UPDATE {}.{} SET _jsonb = $1 WHERE _jsonb->'_id' = $2",
                quote_ident(db),
                quote_ident(METADATA_TABLE)
            ),
            &[&row, &id],
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_column_builds_path_expressions() {
        let col = index_column(&IndexKeyPair {
            field: "v".into(),
            descending: false,
        });
        assert_eq!(col, "((_jsonb -> 'v'))");

        let col = index_column(&IndexKeyPair {
            field: "a.b.c".into(),
            descending: true,
        });
        assert_eq!(col, "((_jsonb -> 'a' -> 'b' -> 'c')) DESC");
    }

    #[test]
    fn pg_index_names_spans_all_collections() {
        let mut map = CollectionMap::new();
        let mut colls = HashMap::new();
        for (name, idx) in [("a", "a_idx_0"), ("b", "b_idx_0")] {
            colls.insert(
                name.to_string(),
                Arc::new(Collection {
                    name: name.to_string(),
                    table_name: format!("{}_t", name),
                    indexes: vec![IndexInfo {
                        name: "_id_".into(),
                        pg_index: idx.to_string(),
                        key: vec![],
                        unique: true,
                    }],
                }),
            );
        }
        map.insert("db".to_string(), colls);

        let names = pg_index_names(&map, "db");
        assert_eq!(names.len(), 2);
        assert!(names.contains("a_idx_0") && names.contains("b_idx_0"));
        assert!(pg_index_names(&map, "other").is_empty());
    }
}
