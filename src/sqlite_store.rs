//! SQLite-backed [`VectorStore`].
//!
//! Each conversation scope gets its own physical table named
//! `chunks_<hash>`, registered in `rag_tables`. Vectors are stored as
//! little-endian f32 BLOBs (see [`vec_to_blob`]).
//!
//! Every search scores with the store's metric. Search is an exact linear
//! scan until the scope has an index registered in `rag_indexes` for that
//! metric. From then on an in-memory HNSW graph ([`AnnIndex`]) is built
//! lazily from the table on the first search, dropped on every write, and
//! its candidates are rescored exactly.
//!
//! Schema changes (table and index creation) are serialized through an
//! internal mutex; reads and row writes go straight to the pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::{ChunkRecord, DistanceMetric, RowFilter, VECTOR_COLUMN};
use convo_rag_core::store::{metric_mismatch, validate_records, VectorStore};
use convo_rag_core::vector::{blob_to_vec, score, vec_to_blob};

use crate::ann::AnnIndex;
use crate::db;
use crate::migrate;

/// Candidates requested from the graph per requested result.
const ANN_OVERSAMPLE: usize = 4;
const ANN_MIN_CANDIDATES: usize = 32;

const SELECT_COLUMNS: &str = "id, vector, file_id, config_id, scope, content, file_name, \
     file_size, mime_type, chunk_index, tokens";

struct TableMeta {
    name: String,
    dimensions: usize,
}

/// Graphs per scope, tagged with the write generation they were built at.
#[derive(Default)]
struct AnnCache {
    generation: HashMap<String, u64>,
    graphs: HashMap<String, (u64, Arc<AnnIndex>)>,
}

impl AnnCache {
    fn get(&self, scope: &str) -> (u64, Option<Arc<AnnIndex>>) {
        let current = self.generation.get(scope).copied().unwrap_or(0);
        match self.graphs.get(scope) {
            Some((built_at, graph)) if *built_at == current => (current, Some(graph.clone())),
            _ => (current, None),
        }
    }

    /// Cache `graph` unless the scope was written to while it was built.
    fn put(&mut self, scope: &str, built_at: u64, graph: Arc<AnnIndex>) {
        let current = self.generation.get(scope).copied().unwrap_or(0);
        if built_at == current {
            self.graphs.insert(scope.to_string(), (built_at, graph));
        }
    }

    fn invalidate(&mut self, scope: &str) {
        *self.generation.entry(scope.to_string()).or_insert(0) += 1;
        self.graphs.remove(scope);
    }
}

pub struct SqliteVectorStore {
    path: PathBuf,
    pool: RwLock<Option<SqlitePool>>,
    schema_lock: Mutex<()>,
    ann: StdMutex<AnnCache>,
    metric: DistanceMetric,
}

impl SqliteVectorStore {
    /// A cosine store over the database file at `path`. Nothing is touched
    /// until [`open`](VectorStore::open).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pool: RwLock::new(None),
            schema_lock: Mutex::new(()),
            ann: StdMutex::new(AnnCache::default()),
            metric: DistanceMetric::default(),
        }
    }

    /// Score searches and build indexes with `metric`.
    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or(RagError::NotInitialized)
    }

    fn with_ann<T>(&self, f: impl FnOnce(&mut AnnCache) -> T) -> Result<T> {
        let mut cache = self
            .ann
            .lock()
            .map_err(|_| RagError::Store("ANN cache lock poisoned".to_string()))?;
        Ok(f(&mut cache))
    }

    async fn lookup_table(&self, pool: &SqlitePool, scope: &str) -> Result<Option<TableMeta>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT table_name, dimensions FROM rag_tables WHERE scope = ?")
                .bind(scope)
                .fetch_optional(pool)
                .await
                .map_err(store_err)?;
        Ok(row.map(|(name, dims)| TableMeta {
            name,
            dimensions: dims as usize,
        }))
    }

    async fn require_table(&self, pool: &SqlitePool, scope: &str) -> Result<TableMeta> {
        self.lookup_table(pool, scope)
            .await?
            .ok_or_else(|| RagError::TableNotFound(scope.to_string()))
    }

    async fn index_metric(&self, pool: &SqlitePool, scope: &str) -> Result<Option<DistanceMetric>> {
        let metric: Option<String> = sqlx::query_scalar(
            "SELECT metric FROM rag_indexes WHERE scope = ? AND column_name = ?",
        )
        .bind(scope)
        .bind(VECTOR_COLUMN)
        .fetch_optional(pool)
        .await
        .map_err(store_err)?;
        metric.as_deref().map(DistanceMetric::parse).transpose()
    }

    /// Cached graph for `scope`, building it from the table when missing.
    async fn ann_for(
        &self,
        pool: &SqlitePool,
        scope: &str,
        table: &TableMeta,
        metric: DistanceMetric,
    ) -> Result<Arc<AnnIndex>> {
        let (generation, cached) = self.with_ann(|c| c.get(scope))?;
        if let Some(graph) = cached {
            return Ok(graph);
        }

        let rows = load_vectors(pool, &table.name).await?;
        let dimensions = table.dimensions;
        let count = rows.len();
        let graph = tokio::task::spawn_blocking(move || AnnIndex::build(metric, dimensions, rows))
            .await
            .map_err(|e| RagError::Store(format!("index build task failed: {}", e)))??;
        let graph = Arc::new(graph);
        debug!(scope, rows = count, metric = metric.as_str(), "built ANN graph");

        self.with_ann(|c| c.put(scope, generation, graph.clone()))?;
        Ok(graph)
    }
}

fn store_err(e: impl std::fmt::Display) -> RagError {
    RagError::Store(e.to_string())
}

/// Physical table name for a scope. Scopes are caller-supplied strings, so
/// they are hashed rather than interpolated.
pub fn table_name(scope: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(scope.as_bytes()));
    format!("chunks_{}", &digest[..16])
}

async fn load_vectors(pool: &SqlitePool, table: &str) -> Result<Vec<(String, Vec<f32>)>> {
    let rows = sqlx::query(&format!("SELECT id, vector FROM {}", table))
        .fetch_all(pool)
        .await
        .map_err(store_err)?;
    rows.iter()
        .map(|row| {
            let id: String = row.try_get("id").map_err(store_err)?;
            let blob: Vec<u8> = row.try_get("vector").map_err(store_err)?;
            Ok((id, blob_to_vec(&blob)))
        })
        .collect()
}

async fn fetch_rows(pool: &SqlitePool, table: &str, ids: &[String]) -> Result<Vec<ChunkRecord>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "SELECT {} FROM {} WHERE id IN ({})",
        SELECT_COLUMNS, table, placeholders
    );
    let mut query = sqlx::query(&sql);
    for id in ids {
        query = query.bind(id);
    }
    let rows = query.fetch_all(pool).await.map_err(store_err)?;
    rows.iter().map(row_to_record).collect()
}

fn row_to_record(row: &SqliteRow) -> Result<ChunkRecord> {
    let blob: Vec<u8> = row.try_get("vector").map_err(store_err)?;
    let file_size: i64 = row.try_get("file_size").map_err(store_err)?;
    let chunk_index: i64 = row.try_get("chunk_index").map_err(store_err)?;
    let tokens: Option<i64> = row.try_get("tokens").map_err(store_err)?;
    Ok(ChunkRecord {
        id: row.try_get("id").map_err(store_err)?,
        vector: blob_to_vec(&blob),
        file_id: row.try_get("file_id").map_err(store_err)?,
        config_id: row.try_get("config_id").map_err(store_err)?,
        scope: row.try_get("scope").map_err(store_err)?,
        content: row.try_get("content").map_err(store_err)?,
        file_name: row.try_get("file_name").map_err(store_err)?,
        file_size: file_size as u32,
        mime_type: row.try_get("mime_type").map_err(store_err)?,
        chunk_index: chunk_index as i32,
        tokens: tokens.map(|t| t as u32),
        distance: None,
        relevance: None,
    })
}

async fn insert_rows(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
    records: &[ChunkRecord],
) -> Result<usize> {
    let sql = format!(
        "INSERT INTO {} ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        table, SELECT_COLUMNS
    );
    for r in records {
        sqlx::query(&sql)
            .bind(&r.id)
            .bind(vec_to_blob(&r.vector))
            .bind(&r.file_id)
            .bind(&r.config_id)
            .bind(&r.scope)
            .bind(&r.content)
            .bind(&r.file_name)
            .bind(r.file_size as i64)
            .bind(&r.mime_type)
            .bind(r.chunk_index as i64)
            .bind(r.tokens.map(|t| t as i64))
            .execute(&mut *conn)
            .await
            .map_err(store_err)?;
    }
    Ok(records.len())
}

async fn delete_matching(
    conn: &mut sqlx::SqliteConnection,
    table: &str,
    filter: &RowFilter,
) -> Result<usize> {
    let result = sqlx::query(&format!(
        "DELETE FROM {} WHERE {} = ?",
        table,
        filter.column()
    ))
    .bind(filter.value())
    .execute(&mut *conn)
    .await
    .map_err(store_err)?;
    Ok(result.rows_affected() as usize)
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn open(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }
        let pool = db::connect(&self.path)
            .await
            .map_err(|e| RagError::Store(format!("{:#}", e)))?;
        migrate::run_migrations(&pool)
            .await
            .map_err(|e| RagError::Store(format!("{:#}", e)))?;
        *guard = Some(pool);
        info!(path = %self.path.display(), "vector store opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            self.with_ann(|c| *c = AnnCache::default())?;
            info!(path = %self.path.display(), "vector store closed");
        }
        Ok(())
    }

    async fn has_table(&self, scope: &str) -> Result<bool> {
        let pool = self.pool().await?;
        Ok(self.lookup_table(&pool, scope).await?.is_some())
    }

    async fn create_empty_table(&self, scope: &str, dimensions: usize) -> Result<()> {
        if dimensions == 0 {
            return Err(RagError::InvalidInput(
                "table dimensions must be > 0".to_string(),
            ));
        }
        let pool = self.pool().await?;
        let _schema = self.schema_lock.lock().await;

        if let Some(existing) = self.lookup_table(&pool, scope).await? {
            if existing.dimensions == dimensions {
                return Ok(());
            }
            return Err(RagError::InvalidInput(format!(
                "scope '{}' already has a {}-dimension table, not {}",
                scope, existing.dimensions, dimensions
            )));
        }

        let name = table_name(scope);
        let mut tx = pool.begin().await.map_err(store_err)?;
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id TEXT PRIMARY KEY,
                vector BLOB NOT NULL,
                file_id TEXT NOT NULL,
                config_id TEXT NOT NULL,
                scope TEXT,
                content TEXT NOT NULL,
                file_name TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                mime_type TEXT,
                chunk_index INTEGER NOT NULL,
                tokens INTEGER
            )
            "#,
            name
        ))
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_file_id ON {}(file_id)",
            name, name
        ))
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        sqlx::query(
            "INSERT INTO rag_tables (scope, table_name, dimensions, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(scope)
        .bind(&name)
        .bind(dimensions as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;
        tx.commit().await.map_err(store_err)?;

        debug!(scope, table = %name, dimensions, "created scope table");
        Ok(())
    }

    async fn count_rows(&self, scope: &str, filter: Option<&RowFilter>) -> Result<usize> {
        let pool = self.pool().await?;
        let table = self.require_table(&pool, scope).await?;
        let count: i64 = match filter {
            Some(f) => sqlx::query_scalar(&format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ?",
                table.name,
                f.column()
            ))
            .bind(f.value())
            .fetch_one(&pool)
            .await
            .map_err(store_err)?,
            None => sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name))
                .fetch_one(&pool)
                .await
                .map_err(store_err)?,
        };
        Ok(count as usize)
    }

    async fn delete_rows(&self, scope: &str, filter: &RowFilter) -> Result<usize> {
        let pool = self.pool().await?;
        let table = self.require_table(&pool, scope).await?;
        let mut conn = pool.acquire().await.map_err(store_err)?;
        let deleted = delete_matching(&mut conn, &table.name, filter).await?;
        self.with_ann(|c| c.invalidate(scope))?;
        Ok(deleted)
    }

    async fn insert(&self, scope: &str, records: &[ChunkRecord]) -> Result<usize> {
        let pool = self.pool().await?;
        let table = self.require_table(&pool, scope).await?;
        validate_records(records, table.dimensions)?;
        let mut tx = pool.begin().await.map_err(store_err)?;
        let inserted = insert_rows(&mut tx, &table.name, records).await?;
        tx.commit().await.map_err(store_err)?;
        self.with_ann(|c| c.invalidate(scope))?;
        Ok(inserted)
    }

    async fn replace_rows(
        &self,
        scope: &str,
        filter: &RowFilter,
        records: &[ChunkRecord],
    ) -> Result<(usize, usize)> {
        let pool = self.pool().await?;
        let table = self.require_table(&pool, scope).await?;
        validate_records(records, table.dimensions)?;
        let mut tx = pool.begin().await.map_err(store_err)?;
        let deleted = delete_matching(&mut tx, &table.name, filter).await?;
        let inserted = insert_rows(&mut tx, &table.name, records).await?;
        tx.commit().await.map_err(store_err)?;
        self.with_ann(|c| c.invalidate(scope))?;
        Ok((deleted, inserted))
    }

    async fn has_index(&self, scope: &str, column: &str) -> Result<bool> {
        let pool = self.pool().await?;
        self.require_table(&pool, scope).await?;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM rag_indexes WHERE scope = ? AND column_name = ?",
        )
        .bind(scope)
        .bind(column)
        .fetch_one(&pool)
        .await
        .map_err(store_err)?;
        Ok(count > 0)
    }

    async fn create_index(
        &self,
        scope: &str,
        column: &str,
        metric: DistanceMetric,
    ) -> Result<()> {
        if column != VECTOR_COLUMN {
            return Err(RagError::InvalidInput(format!(
                "only the '{}' column can be indexed, not '{}'",
                VECTOR_COLUMN, column
            )));
        }
        if metric != self.metric {
            return Err(metric_mismatch(self.metric, metric));
        }
        let pool = self.pool().await?;
        let _schema = self.schema_lock.lock().await;
        self.require_table(&pool, scope).await?;

        sqlx::query(
            r#"
            INSERT INTO rag_indexes (scope, column_name, metric, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(scope, column_name) DO UPDATE SET
                metric = excluded.metric,
                created_at = excluded.created_at
            "#,
        )
        .bind(scope)
        .bind(column)
        .bind(metric.as_str())
        .bind(chrono::Utc::now().timestamp())
        .execute(&pool)
        .await
        .map_err(store_err)?;
        self.with_ann(|c| c.invalidate(scope))?;

        info!(scope, column, metric = metric.as_str(), "created vector index");
        Ok(())
    }

    async fn search(&self, scope: &str, query: &[f32], top_k: usize) -> Result<Vec<ChunkRecord>> {
        let pool = self.pool().await?;
        let table = self.require_table(&pool, scope).await?;
        if query.len() != table.dimensions {
            return Err(RagError::InvalidInput(format!(
                "query vector has {} dimensions, table for '{}' has {}",
                query.len(),
                scope,
                table.dimensions
            )));
        }
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let metric = self.metric;
        let indexed = match self.index_metric(&pool, scope).await? {
            Some(registered) if registered == metric => true,
            Some(registered) => {
                warn!(
                    scope,
                    registered = registered.as_str(),
                    metric = metric.as_str(),
                    "index registered with another metric; scanning linearly"
                );
                false
            }
            None => false,
        };

        let mut scored: Vec<ChunkRecord> = if indexed {
            let graph = self.ann_for(&pool, scope, &table, metric).await?;
            let k = (top_k * ANN_OVERSAMPLE).max(ANN_MIN_CANDIDATES);
            let ids = graph.candidates(query, k)?;
            let mut rows = fetch_rows(&pool, &table.name, &ids).await?;
            for r in rows.iter_mut() {
                r.distance = Some(score(metric, query, &r.vector));
            }
            rows
        } else {
            let mut ranked: Vec<(String, f32)> = load_vectors(&pool, &table.name)
                .await?
                .into_iter()
                .map(|(id, v)| {
                    let s = score(metric, query, &v);
                    (id, s)
                })
                .collect();
            ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            ranked.truncate(top_k);

            let scores: HashMap<String, f32> = ranked.into_iter().collect();
            let ids: Vec<String> = scores.keys().cloned().collect();
            let mut rows = fetch_rows(&pool, &table.name, &ids).await?;
            for r in rows.iter_mut() {
                r.distance = scores.get(&r.id).copied();
            }
            rows
        };

        scored.sort_by(|a, b| {
            b.distance
                .partial_cmp(&a.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_is_stable_and_sql_safe() {
        let a = table_name("conversation 1; DROP TABLE x");
        assert_eq!(a, table_name("conversation 1; DROP TABLE x"));
        assert!(a.starts_with("chunks_"));
        assert_eq!(a.len(), "chunks_".len() + 16);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert_ne!(a, table_name("conversation 2"));
    }

    #[test]
    fn stale_graph_is_not_cached() {
        let mut cache = AnnCache::default();
        let (built_at, cached) = cache.get("s");
        assert!(cached.is_none());
        cache.invalidate("s");
        let graph = Arc::new(AnnIndex::build(DistanceMetric::Cosine, 2, Vec::new()).unwrap());
        cache.put("s", built_at, graph.clone());
        assert!(cache.get("s").1.is_none());

        let (built_at, _) = cache.get("s");
        cache.put("s", built_at, graph);
        assert!(cache.get("s").1.is_some());
    }
}
