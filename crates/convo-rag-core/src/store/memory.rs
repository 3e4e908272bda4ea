//! In-memory [`VectorStore`] implementation for tests and embedded use.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock` for thread safety.
//! Search is brute-force scoring over every row of the scope with the
//! store's metric; an "index" is only a marker for the index policy.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{RagError, Result};
use crate::models::{ChunkRecord, DistanceMetric, RowFilter};
use crate::vector::score;

use super::{metric_mismatch, validate_records, VectorStore};

struct MemTable {
    dimensions: usize,
    rows: Vec<ChunkRecord>,
    /// Indexed column names.
    indexes: HashSet<String>,
}

type Tables = HashMap<String, MemTable>;

/// In-memory store. `None` until [`open`](VectorStore::open) is called.
pub struct InMemoryVectorStore {
    tables: RwLock<Option<Tables>>,
    metric: DistanceMetric,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::with_metric(DistanceMetric::default())
    }

    /// A store that scores every search with `metric`.
    pub fn with_metric(metric: DistanceMetric) -> Self {
        Self {
            tables: RwLock::new(None),
            metric,
        }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> Result<T>) -> Result<T> {
        let guard = self.tables.read().map_err(|_| poisoned())?;
        let tables = guard.as_ref().ok_or(RagError::NotInitialized)?;
        f(tables)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut guard = self.tables.write().map_err(|_| poisoned())?;
        let tables = guard.as_mut().ok_or(RagError::NotInitialized)?;
        f(tables)
    }
}

impl Default for InMemoryVectorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned() -> RagError {
    RagError::Store("in-memory store lock poisoned".to_string())
}

fn missing(scope: &str) -> RagError {
    RagError::TableNotFound(scope.to_string())
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn open(&self) -> Result<()> {
        let mut guard = self.tables.write().map_err(|_| poisoned())?;
        if guard.is_none() {
            *guard = Some(HashMap::new());
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // Rows survive close; a later open() sees them again.
        Ok(())
    }

    async fn has_table(&self, scope: &str) -> Result<bool> {
        self.read(|t| Ok(t.contains_key(scope)))
    }

    async fn create_empty_table(&self, scope: &str, dimensions: usize) -> Result<()> {
        if dimensions == 0 {
            return Err(RagError::InvalidInput(
                "table dimensions must be > 0".to_string(),
            ));
        }
        self.write(|t| match t.get(scope) {
            Some(existing) if existing.dimensions == dimensions => Ok(()),
            Some(existing) => Err(RagError::InvalidInput(format!(
                "scope '{}' already has a {}-dimension table, not {}",
                scope, existing.dimensions, dimensions
            ))),
            None => {
                t.insert(
                    scope.to_string(),
                    MemTable {
                        dimensions,
                        rows: Vec::new(),
                        indexes: HashSet::new(),
                    },
                );
                Ok(())
            }
        })
    }

    async fn count_rows(&self, scope: &str, filter: Option<&RowFilter>) -> Result<usize> {
        self.read(|t| {
            let table = t.get(scope).ok_or_else(|| missing(scope))?;
            Ok(match filter {
                Some(f) => table.rows.iter().filter(|r| f.matches(r)).count(),
                None => table.rows.len(),
            })
        })
    }

    async fn delete_rows(&self, scope: &str, filter: &RowFilter) -> Result<usize> {
        self.write(|t| {
            let table = t.get_mut(scope).ok_or_else(|| missing(scope))?;
            let before = table.rows.len();
            table.rows.retain(|r| !filter.matches(r));
            Ok(before - table.rows.len())
        })
    }

    async fn insert(&self, scope: &str, records: &[ChunkRecord]) -> Result<usize> {
        self.write(|t| {
            let table = t.get_mut(scope).ok_or_else(|| missing(scope))?;
            validate_records(records, table.dimensions)?;
            table.rows.extend(records.iter().cloned().map(strip_annotations));
            Ok(records.len())
        })
    }

    async fn replace_rows(
        &self,
        scope: &str,
        filter: &RowFilter,
        records: &[ChunkRecord],
    ) -> Result<(usize, usize)> {
        self.write(|t| {
            let table = t.get_mut(scope).ok_or_else(|| missing(scope))?;
            validate_records(records, table.dimensions)?;
            let before = table.rows.len();
            table.rows.retain(|r| !filter.matches(r));
            let deleted = before - table.rows.len();
            table.rows.extend(records.iter().cloned().map(strip_annotations));
            Ok((deleted, records.len()))
        })
    }

    async fn has_index(&self, scope: &str, column: &str) -> Result<bool> {
        self.read(|t| {
            let table = t.get(scope).ok_or_else(|| missing(scope))?;
            Ok(table.indexes.contains(column))
        })
    }

    async fn create_index(
        &self,
        scope: &str,
        column: &str,
        metric: DistanceMetric,
    ) -> Result<()> {
        if metric != self.metric {
            return Err(metric_mismatch(self.metric, metric));
        }
        self.write(|t| {
            let table = t.get_mut(scope).ok_or_else(|| missing(scope))?;
            table.indexes.insert(column.to_string());
            Ok(())
        })
    }

    async fn search(&self, scope: &str, query: &[f32], top_k: usize) -> Result<Vec<ChunkRecord>> {
        self.read(|t| {
            let table = t.get(scope).ok_or_else(|| missing(scope))?;
            if query.len() != table.dimensions {
                return Err(RagError::InvalidInput(format!(
                    "query vector has {} dimensions, table '{}' has {}",
                    query.len(),
                    scope,
                    table.dimensions
                )));
            }
            let metric = self.metric;
            let mut scored: Vec<(f32, &ChunkRecord)> = table
                .rows
                .iter()
                .map(|r| (score(metric, query, &r.vector), r))
                .collect();
            scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(top_k);

            Ok(scored
                .into_iter()
                .map(|(s, r)| {
                    let mut hit = r.clone();
                    hit.distance = Some(s);
                    hit
                })
                .collect())
        })
    }
}

fn strip_annotations(mut record: ChunkRecord) -> ChunkRecord {
    record.distance = None;
    record.relevance = None;
    record
}
