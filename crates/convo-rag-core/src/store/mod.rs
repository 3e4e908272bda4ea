//! Storage abstraction for convo-rag.
//!
//! The [`VectorStore`] trait defines every persistence and nearest-neighbor
//! operation the ingestion pipeline and the search manager need, with one
//! logical table per conversation scope.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Failure semantics
//!
//! - Any operation other than `open`/`close` before a successful `open`
//!   fails with [`RagError::NotInitialized`](crate::RagError::NotInitialized).
//! - Operations on a scope without a table fail with
//!   [`RagError::TableNotFound`](crate::RagError::TableNotFound); tables are
//!   never created implicitly.

pub mod memory;

use async_trait::async_trait;

use crate::error::{RagError, Result};
use crate::models::{ChunkRecord, DistanceMetric, RowFilter};

/// Abstract vector storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`open`](VectorStore::open) / [`close`](VectorStore::close) | Lazy, idempotent lifecycle |
/// | [`has_table`](VectorStore::has_table) / [`create_empty_table`](VectorStore::create_empty_table) | Per-scope tables |
/// | [`count_rows`](VectorStore::count_rows) / [`delete_rows`](VectorStore::delete_rows) | Filtered row maintenance |
/// | [`insert`](VectorStore::insert) / [`replace_rows`](VectorStore::replace_rows) | Persist chunk records |
/// | [`has_index`](VectorStore::has_index) / [`create_index`](VectorStore::create_index) | ANN index lifecycle |
/// | [`search`](VectorStore::search) | Top-k nearest rows, best first |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Acquire the backing engine. Calling it again is a no-op.
    async fn open(&self) -> Result<()>;

    /// Release the backing engine. Safe when never opened.
    async fn close(&self) -> Result<()>;

    async fn has_table(&self, scope: &str) -> Result<bool>;

    /// Create the table for `scope`. Existing tables with the same
    /// dimensionality are left untouched.
    async fn create_empty_table(&self, scope: &str, dimensions: usize) -> Result<()>;

    /// Number of rows in the scope, optionally restricted by `filter`.
    async fn count_rows(&self, scope: &str, filter: Option<&RowFilter>) -> Result<usize>;

    /// Delete every row matching `filter`, returning how many went.
    async fn delete_rows(&self, scope: &str, filter: &RowFilter) -> Result<usize>;

    /// Append records. Every record must carry an id and a vector of the
    /// table's dimensionality.
    async fn insert(&self, scope: &str, records: &[ChunkRecord]) -> Result<usize>;

    /// Delete rows matching `filter`, then insert `records`.
    ///
    /// Returns `(deleted, inserted)`. Backends with transactions override
    /// this so readers never observe the gap.
    async fn replace_rows(
        &self,
        scope: &str,
        filter: &RowFilter,
        records: &[ChunkRecord],
    ) -> Result<(usize, usize)> {
        let deleted = self.delete_rows(scope, filter).await?;
        let inserted = self.insert(scope, records).await?;
        Ok((deleted, inserted))
    }

    async fn has_index(&self, scope: &str, column: &str) -> Result<bool>;

    /// Build an approximate-nearest-neighbor index over `column`.
    ///
    /// Every search of a store scores with one metric, indexed or not, so a
    /// `metric` other than the store's fails with `InvalidInput`.
    async fn create_index(&self, scope: &str, column: &str, metric: DistanceMetric)
        -> Result<()>;

    /// Up to `top_k` rows nearest to `query`, best first, with
    /// [`ChunkRecord::distance`] populated (higher is closer).
    async fn search(&self, scope: &str, query: &[f32], top_k: usize) -> Result<Vec<ChunkRecord>>;
}

/// Error for an index requested with a metric other than the store's.
pub fn metric_mismatch(store: DistanceMetric, requested: DistanceMetric) -> RagError {
    RagError::InvalidInput(format!(
        "store scores with {}, cannot index with {}",
        store.as_str(),
        requested.as_str()
    ))
}

/// Every record needs an id and a vector matching the table.
pub fn validate_records(records: &[ChunkRecord], dimensions: usize) -> Result<()> {
    for r in records {
        if r.id.is_empty() {
            return Err(RagError::InvalidInput(format!(
                "chunk {} of file '{}' has no id",
                r.chunk_index, r.file_id
            )));
        }
        if !r.has_vector(dimensions) {
            return Err(RagError::InvalidInput(format!(
                "chunk '{}' has a {}-dimension vector, table expects {}",
                r.id,
                r.vector.len(),
                dimensions
            )));
        }
    }
    Ok(())
}
