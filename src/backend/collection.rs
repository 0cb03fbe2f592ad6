use std::sync::Arc;

use tokio_postgres::types::ToSql;
use tracing::debug;

use crate::errors::{is_unique_violation, StoatDBError};
use crate::iterator::QueryIterator;
use crate::metadata::{self, IndexInfo, IndexRequest, Registry};
use crate::query::{prepare_query, quote_ident, PreparedQuery, QueryInput, SqlArg};
use crate::sjson;
use crate::types::{Array, Document, Value};

/// A handle on one collection; all document operations live here.
#[derive(Debug, Clone)]
pub struct Collection {
    registry: Arc<Registry>,
    db: String,
    name: String,
}

/// Parameters for [`Collection::query`] and [`Collection::explain`].
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filter: Option<Document>,
    /// A document of field → ±1 pairs.
    pub sort: Option<Document>,
    /// Zero means no limit.
    pub limit: i64,
}

/// A lazy query result with flags describing how much work was pushed down.
///
/// When `filter_pushdown` or `filter_exact` is false, the iterator yields a
/// superset of the matching documents and the caller re-filters (see
/// [`crate::filter::matches`]); when `sort_pushdown` is false the caller
/// sorts; when `limit_pushdown` is false the caller limits.
#[derive(Debug)]
pub struct QueryResult {
    pub iter: QueryIterator,
    pub filter_pushdown: bool,
    pub filter_exact: bool,
    pub sort_pushdown: bool,
    pub limit_pushdown: bool,
}

/// The backend's plan for a query, plus the same flags a [`QueryResult`]
/// would carry.
#[derive(Debug)]
pub struct ExplainResult {
    /// A document with a `Queries` array holding one entry per query, each
    /// carrying the backend's `Plan`.
    pub query_plan: Document,
    pub filter_pushdown: bool,
    pub filter_exact: bool,
    pub sort_pushdown: bool,
    pub limit_pushdown: bool,
}

/// Storage statistics for one collection table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Estimated document count, from the planner's row estimate.
    pub count_documents: i64,
    /// Bytes in the table's main fork.
    pub size_table: i64,
    /// Bytes in the table's free space map.
    pub size_free: i64,
    /// Bytes in the table's indexes.
    pub size_indexes: i64,
}

impl Collection {
    pub(crate) fn new(registry: Arc<Registry>, db: String, name: String) -> Self {
        Self { registry, db, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs a filtered, sorted, limited query and streams the documents.
    ///
    /// This never fails on unsupported filters: whatever cannot be translated
    /// widens the SQL result, and the flags tell the caller to re-filter.
    pub async fn query(&self, params: QueryParams) -> Result<QueryResult, StoatDBError> {
        let meta = match self.registry.collection_get(&self.db, &self.name).await? {
            Some(meta) => meta,
            None => {
                return Ok(QueryResult {
                    iter: QueryIterator::empty(),
                    filter_pushdown: true,
                    filter_exact: true,
                    sort_pushdown: true,
                    limit_pushdown: true,
                });
            }
        };

        let prepared = prepare(&self.db, &meta, &params);
        let pg = self.registry.pg().await?;
        let client = pg.get().await?;

        let args: Vec<&(dyn ToSql + Sync)> = prepared.args.iter().map(SqlArg::as_sql).collect();
        let rows = client.query_raw(prepared.sql.as_str(), args).await?;
        debug!(db = %self.db, coll = %self.name, sql = %prepared.sql, "running query");

        Ok(QueryResult {
            iter: QueryIterator::new(client, rows, false, false),
            filter_pushdown: prepared.filter_pushdown,
            filter_exact: prepared.filter_exact,
            sort_pushdown: prepared.sort_pushdown,
            limit_pushdown: prepared.limit_pushdown,
        })
    }

    /// Inserts all documents in one transaction, creating the collection (and
    /// database) first when absent. A duplicate `_id` fails the whole batch
    /// with [`StoatDBError::InsertDuplicateId`].
    pub async fn insert_all(&self, docs: &[Document]) -> Result<(), StoatDBError> {
        self.registry.collection_create(&self.db, &self.name).await?;
        let meta = self
            .registry
            .collection_get(&self.db, &self.name)
            .await?
            .ok_or_else(|| StoatDBError::CollectionDoesNotExist(self.name.clone()))?;

        let pg = self.registry.pg().await?;
        let mut client = pg.get().await?;
        let tx = client.transaction().await?;

        let sql = format!(
            "INSERT INTO {}.{} (_jsonb) VALUES ($1)",
            quote_ident(&self.db),
            quote_ident(&meta.table_name)
        );
        for doc in docs {
            let row = sjson::marshal_json(doc);
            tx.execute(sql.as_str(), &[&row]).await.map_err(|err| {
                if is_unique_violation(&err) {
                    StoatDBError::InsertDuplicateId
                } else {
                    StoatDBError::Postgres(err)
                }
            })?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Replaces each document by its `_id` in one transaction; returns how
    /// many rows changed. Every input document must carry `_id`.
    pub async fn update_all(&self, docs: &[Document]) -> Result<u64, StoatDBError> {
        let meta = match self.registry.collection_get(&self.db, &self.name).await? {
            Some(meta) => meta,
            None => return Ok(0),
        };

        let pg = self.registry.pg().await?;
        let mut client = pg.get().await?;
        let tx = client.transaction().await?;

        let sql = format!(
            "UPDATE {}.{} SET _jsonb = $1 WHERE _jsonb->'_id' = $2",
            quote_ident(&self.db),
            quote_ident(&meta.table_name)
        );
        let mut updated = 0u64;
        for doc in docs {
            let id = doc.get("_id").expect("document must have _id");
            let row = sjson::marshal_json(doc);
            let id_json = sjson::single_value_json(id);
            updated += tx.execute(sql.as_str(), &[&row, &id_json]).await?;
        }
        tx.commit().await?;
        Ok(updated)
    }

    /// Deletes documents by `_id` with a single statement; returns the count.
    pub async fn delete_all(&self, ids: &[Value]) -> Result<u64, StoatDBError> {
        let meta = match self.registry.collection_get(&self.db, &self.name).await? {
            Some(meta) => meta,
            None => return Ok(0),
        };
        if ids.is_empty() {
            return Ok(0);
        }

        let pg = self.registry.pg().await?;
        let client = pg.get().await?;

        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "DELETE FROM {}.{} WHERE _jsonb->'_id' IN ({})",
            quote_ident(&self.db),
            quote_ident(&meta.table_name),
            placeholders.join(", ")
        );
        let args: Vec<serde_json::Value> = ids.iter().map(sjson::single_value_json).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = args.iter().map(|a| a as _).collect();
        Ok(client.execute(sql.as_str(), &refs).await?)
    }

    /// Returns the backend's plan for the query the same parameters would run.
    pub async fn explain(&self, params: QueryParams) -> Result<ExplainResult, StoatDBError> {
        let meta = self
            .registry
            .collection_get(&self.db, &self.name)
            .await?
            .ok_or_else(|| StoatDBError::CollectionDoesNotExist(self.name.clone()))?;

        let prepared = prepare(&self.db, &meta, &params);
        let sql = format!("EXPLAIN (VERBOSE true, FORMAT JSON) {}", prepared.sql);

        let pg = self.registry.pg().await?;
        let client = pg.get().await?;
        let args: Vec<&(dyn ToSql + Sync)> = prepared.args.iter().map(SqlArg::as_sql).collect();
        let row = client.query_one(sql.as_str(), &args).await?;

        // The backend emits one array entry per query, each holding a Plan
        // key; keep that shape under a Queries field.
        let plan: serde_json::Value = row.get(0);
        let mut queries = Array::new();
        if let serde_json::Value::Array(items) = plan {
            for item in items {
                if let Value::Document(doc) = Value::from_plain_json(item) {
                    queries.push(Value::Document(doc));
                }
            }
        }
        let mut query_plan = Document::new();
        query_plan.set("Queries", Value::Array(queries));

        Ok(ExplainResult {
            query_plan,
            filter_pushdown: prepared.filter_pushdown,
            filter_exact: prepared.filter_exact,
            sort_pushdown: prepared.sort_pushdown,
            limit_pushdown: prepared.limit_pushdown,
        })
    }

    /// Planner row estimate and relation sizes for this collection's table,
    /// optionally refreshing the estimates first.
    pub async fn stats(&self, refresh: bool) -> Result<CollectionStats, StoatDBError> {
        let meta = self
            .registry
            .collection_get(&self.db, &self.name)
            .await?
            .ok_or_else(|| StoatDBError::CollectionDoesNotExist(self.name.clone()))?;

        let pg = self.registry.pg().await?;
        let client = pg.get().await?;

        if refresh {
            let sql = format!(
                "ANALYZE {}.{}",
                quote_ident(&self.db),
                quote_ident(&meta.table_name)
            );
            client.batch_execute(&sql).await?;
        }

        let row = client
            .query_one(
                "SELECT GREATEST(c.reltuples, 0)::bigint, \
                 pg_relation_size(c.oid, 'main'), \
                 pg_relation_size(c.oid, 'fsm'), \
                 pg_indexes_size(c.oid) \
                 FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE n.nspname = $1 AND c.relname = $2",
                &[&self.db, &meta.table_name],
            )
            .await?;

        Ok(CollectionStats {
            count_documents: row.get(0),
            size_table: row.get(1),
            size_free: row.get(2),
            size_indexes: row.get(3),
        })
    }

    /// Reclaims table space and refreshes planner estimates.
    pub async fn compact(&self, full: bool) -> Result<(), StoatDBError> {
        let meta = self
            .registry
            .collection_get(&self.db, &self.name)
            .await?
            .ok_or_else(|| StoatDBError::CollectionDoesNotExist(self.name.clone()))?;

        let pg = self.registry.pg().await?;
        let client = pg.get().await?;
        let sql = format!(
            "VACUUM {}ANALYZE {}.{}",
            if full { "FULL " } else { "" },
            quote_ident(&self.db),
            quote_ident(&meta.table_name)
        );
        client.batch_execute(&sql).await?;
        Ok(())
    }

    /// The collection's indexes, default `_id_` index included.
    pub async fn list_indexes(&self) -> Result<Vec<IndexInfo>, StoatDBError> {
        let meta = self
            .registry
            .collection_get(&self.db, &self.name)
            .await?
            .ok_or_else(|| StoatDBError::CollectionDoesNotExist(self.name.clone()))?;
        Ok(meta.indexes.clone())
    }

    /// Creates indexes, creating the collection first when absent. Returns how
    /// many indexes were actually created; existing names are skipped.
    pub async fn create_indexes(&self, requests: &[IndexRequest]) -> Result<usize, StoatDBError> {
        self.registry.collection_create(&self.db, &self.name).await?;
        self.registry
            .indexes_create(&self.db, &self.name, requests)
            .await
    }

    /// Drops the named indexes where they exist.
    pub async fn drop_indexes(&self, names: &[String]) -> Result<(), StoatDBError> {
        self.registry.indexes_drop(&self.db, &self.name, names).await
    }
}

fn prepare(db: &str, meta: &metadata::Collection, params: &QueryParams) -> PreparedQuery {
    prepare_query(&QueryInput {
        schema: db,
        table: &meta.table_name,
        capped: false,
        only_record_ids: false,
        filter: params.filter.as_ref(),
        sort: params.sort.as_ref(),
        limit: params.limit,
    })
}
