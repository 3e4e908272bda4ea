//! `chunk` stage: read the source file and split it into vectorless records.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use convo_rag_core::chunk::Chunker;
use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::{LocalFileMeta, TaskInfo, TaskStatus};

use super::pool::StagePool;
use super::TaskChain;
use crate::cancel::cancellable;
use crate::reader::FileReader;

pub const CHUNK_STAGE: &str = "chunk";

pub struct ChunkStage {
    reader: Arc<dyn FileReader>,
    chunker: Arc<dyn Chunker>,
    pool: StagePool,
}

impl ChunkStage {
    pub fn new(reader: Arc<dyn FileReader>, chunker: Arc<dyn Chunker>, workers: usize) -> Self {
        Self {
            reader,
            chunker,
            pool: StagePool::new(workers),
        }
    }

    async fn chunk(&self, info: &mut TaskInfo, cancel: &CancellationToken) -> Result<String> {
        let ticket = self.pool.enter(info.file_id(), cancel).await?;
        let content = cancellable(ticket.token(), self.reader.read(&info.info.meta)).await?;

        if content.text.trim().is_empty() {
            return Err(RagError::InvalidInput(format!(
                "{} contains no text",
                content.info.file_name
            )));
        }
        info.info = content.info;

        let records = self.chunker.chunk(&info.info, &content.text, &info.config);
        if records.is_empty() {
            return Err(RagError::InvalidInput(format!(
                "{} produced no chunks",
                info.info.file_name
            )));
        }
        if records.len() > info.config.max_file_chunks {
            return Err(RagError::TooLarge(format!(
                "{} splits into {} chunks, limit is {}",
                info.info.file_name,
                records.len(),
                info.config.max_file_chunks
            )));
        }

        debug!(
            file_id = %info.file_id(),
            chunks = records.len(),
            bytes = info.info.file_size,
            "chunked file"
        );
        let count = records.len();
        info.data = records;
        Ok(format!("{} chunks", count))
    }
}

#[async_trait]
impl TaskChain for ChunkStage {
    fn task_id(&self) -> &'static str {
        CHUNK_STAGE
    }

    async fn process(&self, info: &mut TaskInfo, cancel: CancellationToken) -> TaskStatus {
        match self.chunk(info, &cancel).await {
            Ok(message) => TaskStatus::success(CHUNK_STAGE, message),
            Err(e) => TaskStatus::from_error(CHUNK_STAGE, &e),
        }
    }

    fn stop(&self, meta: Option<&LocalFileMeta>) {
        self.pool.stop(meta.map(|m| m.id.as_str()));
    }
}
