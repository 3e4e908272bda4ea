//! `persist` stage: replace the file's chunk set in its scope table.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::{
    ChunkRecord, DistanceMetric, LocalFileMeta, RowFilter, TaskInfo, TaskStatus, VECTOR_COLUMN,
};
use convo_rag_core::store::VectorStore;

use super::pool::StagePool;
use super::TaskChain;
use crate::cancel::cancellable;

pub const PERSIST_STAGE: &str = "persist";

pub struct PersistStage {
    store: Arc<dyn VectorStore>,
    pool: StagePool,
    /// Held while deciding on and building an index.
    index_lock: Mutex<()>,
    index_threshold: usize,
    metric: DistanceMetric,
}

impl PersistStage {
    pub fn new(
        store: Arc<dyn VectorStore>,
        workers: usize,
        index_threshold: usize,
        metric: DistanceMetric,
    ) -> Self {
        Self {
            store,
            pool: StagePool::new(workers),
            index_lock: Mutex::new(()),
            index_threshold,
            metric,
        }
    }

    async fn persist(&self, info: &mut TaskInfo, cancel: &CancellationToken) -> Result<String> {
        let ticket = self.pool.enter(info.file_id(), cancel).await?;
        let cancel = ticket.token();
        let scope = info.scope().to_string();
        let dimensions = info.config.dimensions;

        let mut records: Vec<ChunkRecord> = info
            .data
            .iter()
            .filter(|r| r.has_vector(dimensions))
            .cloned()
            .collect();
        if records.is_empty() {
            return Err(RagError::InvalidInput(format!(
                "{} has no embedded chunks to persist",
                info.info.file_name
            )));
        }
        for record in records.iter_mut() {
            record.id = Uuid::new_v4().to_string();
            record.scope.get_or_insert_with(|| scope.clone());
        }

        cancellable(cancel, self.store.open()).await?;
        if !cancellable(cancel, self.store.has_table(&scope)).await? {
            cancellable(cancel, self.store.create_empty_table(&scope, dimensions)).await?;
        }

        let filter = RowFilter::FileId(info.file_id().to_string());
        let (deleted, inserted) =
            cancellable(cancel, self.store.replace_rows(&scope, &filter, &records)).await?;
        info.data = records;

        let mut message = if deleted > 0 {
            format!("{} rows inserted ({} replaced)", inserted, deleted)
        } else {
            format!("{} rows inserted", inserted)
        };
        // The rows are committed either way; the stage stays successful.
        if let Err(e) = self.apply_index_policy(&scope).await {
            warn!(scope = %scope, error = %e, "index policy failed; rows are persisted");
            message.push_str(&format!("; index build failed: {}", e));
        }
        Ok(message)
    }

    /// Build the vector index once a scope outgrows the linear scan.
    async fn apply_index_policy(&self, scope: &str) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let rows = self.store.count_rows(scope, None).await?;
        if rows <= self.index_threshold || self.store.has_index(scope, VECTOR_COLUMN).await? {
            return Ok(());
        }
        self.store
            .create_index(scope, VECTOR_COLUMN, self.metric)
            .await?;
        info!(scope, rows, metric = self.metric.as_str(), "scope indexed");
        Ok(())
    }
}

#[async_trait]
impl TaskChain for PersistStage {
    fn task_id(&self) -> &'static str {
        PERSIST_STAGE
    }

    async fn process(&self, info: &mut TaskInfo, cancel: CancellationToken) -> TaskStatus {
        match self.persist(info, &cancel).await {
            Ok(message) => TaskStatus::success(PERSIST_STAGE, message),
            Err(e) => TaskStatus::from_error(PERSIST_STAGE, &e),
        }
    }

    fn stop(&self, meta: Option<&LocalFileMeta>) {
        self.pool.stop(meta.map(|m| m.id.as_str()));
    }
}
