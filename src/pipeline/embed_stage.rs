//! `embed` stage: attach a vector to every chunk.
//!
//! Chunks are grouped into batches of at most `max_inputs`; every batch is
//! one request, sent concurrently under a pipeline-wide cap on in-flight
//! requests. Vectors are assigned back batch by batch. A batch whose
//! response has the wrong count or dimension leaves its chunks without
//! vectors, and those chunks are dropped. The stage fails only when no
//! batch succeeded.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::{EmbeddingConfig, LocalFileMeta, TaskInfo, TaskStatus};

use super::pool::StagePool;
use super::TaskChain;
use crate::cancel::cancellable;
use crate::embedding::{check_embeddings, EmbeddingClient};

pub const EMBED_STAGE: &str = "embed";

pub struct EmbedStage {
    client: Arc<dyn EmbeddingClient>,
    requests: Arc<Semaphore>,
    pool: StagePool,
}

impl EmbedStage {
    pub fn new(client: Arc<dyn EmbeddingClient>, workers: usize, max_requests: usize) -> Self {
        Self {
            client,
            requests: Arc::new(Semaphore::new(max_requests.max(1))),
            pool: StagePool::new(workers),
        }
    }

    async fn embed_batch(
        &self,
        config: &EmbeddingConfig,
        inputs: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>> {
        let _permit = cancellable(cancel, async {
            self.requests
                .acquire()
                .await
                .map_err(|_| RagError::Aborted)
        })
        .await?;
        let vectors = cancellable(cancel, self.client.embed(config, inputs)).await?;
        check_embeddings(config, inputs.len(), &vectors)?;
        Ok(vectors)
    }

    async fn embed(&self, info: &mut TaskInfo, cancel: &CancellationToken) -> Result<String> {
        let ticket = self.pool.enter(info.file_id(), cancel).await?;
        let cancel = ticket.token();

        if info.data.is_empty() {
            return Err(RagError::InvalidInput(format!(
                "{} has no chunks to embed",
                info.info.file_name
            )));
        }

        let config = info.config.clone();
        let batch_size = config.max_inputs.max(1);
        let batches: Vec<Vec<String>> = info
            .data
            .chunks(batch_size)
            .map(|batch| batch.iter().map(|r| r.content.clone()).collect())
            .collect();

        let results = join_all(
            batches
                .iter()
                .map(|inputs| self.embed_batch(&config, inputs, cancel)),
        )
        .await;

        if cancel.is_cancelled() || results.iter().any(|r| matches!(r, Err(e) if e.is_aborted())) {
            return Err(RagError::Aborted);
        }

        let total = info.data.len();
        let mut first_error: Option<RagError> = None;
        let mut failed_batches = 0usize;
        for (batch_index, result) in results.into_iter().enumerate() {
            match result {
                Ok(vectors) => {
                    let start = batch_index * batch_size;
                    for (offset, vector) in vectors.into_iter().enumerate() {
                        if let Some(record) = info.data.get_mut(start + offset) {
                            record.vector = vector;
                        }
                    }
                    debug!(file_id = %info.file_id(), batch = batch_index, "batch embedded");
                }
                Err(e) => {
                    warn!(
                        file_id = %info.file_id(),
                        batch = batch_index,
                        error = %e,
                        "embedding batch failed"
                    );
                    failed_batches += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        if failed_batches == batches.len() {
            return Err(first_error.unwrap_or_else(|| {
                RagError::Upstream("every embedding batch failed".to_string())
            }));
        }

        info.data.retain(|r| r.has_vector(config.dimensions));
        let kept = info.data.len();
        if failed_batches > 0 {
            Ok(format!(
                "{} of {} chunks embedded ({} of {} batches failed)",
                kept,
                total,
                failed_batches,
                batches.len()
            ))
        } else {
            Ok(format!("{} of {} chunks embedded", kept, total))
        }
    }
}

#[async_trait]
impl TaskChain for EmbedStage {
    fn task_id(&self) -> &'static str {
        EMBED_STAGE
    }

    async fn process(&self, info: &mut TaskInfo, cancel: CancellationToken) -> TaskStatus {
        match self.embed(info, &cancel).await {
            Ok(message) => TaskStatus::success(EMBED_STAGE, message),
            Err(e) => TaskStatus::from_error(EMBED_STAGE, &e),
        }
    }

    fn stop(&self, meta: Option<&LocalFileMeta>) {
        self.pool.stop(meta.map(|m| m.id.as_str()));
    }
}
