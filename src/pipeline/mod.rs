//! Ingestion pipeline: Chunk → Embed → Persist.
//!
//! A [`TaskManager`] runs one [`TaskInfo`] per file through an ordered chain
//! of [`TaskChain`] stages. Each stage result is recorded in the run's
//! status log and published as an [`IngestEvent`]; the first stage that does
//! not succeed halts that file's chain. Other files are unaffected.
//!
//! # Status log
//!
//! ```text
//! chunk:pending
//! chunk:processing   chunk:success
//! embed:processing   embed:success
//! persist:processing persist:success   (finished)
//! ```

pub mod chunk_stage;
pub mod embed_stage;
pub mod persist_stage;
pub mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use convo_rag_core::chunk::Chunker;
use convo_rag_core::error::RagError;
use convo_rag_core::models::{
    DistanceMetric, EmbeddingConfig, LocalFileMeta, TaskInfo, TaskState, TaskStatus,
};
use convo_rag_core::store::VectorStore;

use crate::embedding::EmbeddingClient;
use crate::events::{IngestEvent, RagEvent, StatusObserver};
use crate::reader::FileReader;

pub use chunk_stage::ChunkStage;
pub use embed_stage::EmbedStage;
pub use persist_stage::PersistStage;

/// One step of the ingestion chain.
#[async_trait]
pub trait TaskChain: Send + Sync {
    /// Stage id recorded in every status this stage produces.
    fn task_id(&self) -> &'static str;

    /// Work on `info` and report the outcome. Cancellation of `cancel` must
    /// end in an [`Aborted`](TaskState::Aborted) status.
    async fn process(&self, info: &mut TaskInfo, cancel: CancellationToken) -> TaskStatus;

    /// Cancel queued and running work for one file, or for all files.
    fn stop(&self, meta: Option<&LocalFileMeta>);
}

/// Sizing and index policy shared by the standard stages.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub stage_workers: usize,
    pub embed_requests: usize,
    pub index_threshold: usize,
    pub metric: DistanceMetric,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            stage_workers: 5,
            embed_requests: 5,
            index_threshold: 256,
            metric: DistanceMetric::Cosine,
        }
    }
}

struct RunEntry {
    file_id: String,
    cancel: CancellationToken,
}

pub struct TaskManager {
    stages: Vec<Arc<dyn TaskChain>>,
    observer: Arc<dyn StatusObserver>,
    runs: Mutex<HashMap<u64, RunEntry>>,
    next_run: AtomicU64,
}

impl TaskManager {
    pub fn new(stages: Vec<Arc<dyn TaskChain>>, observer: Arc<dyn StatusObserver>) -> Self {
        Self {
            stages,
            observer,
            runs: Mutex::new(HashMap::new()),
            next_run: AtomicU64::new(0),
        }
    }

    /// The Chunk → Embed → Persist chain.
    pub fn standard(
        reader: Arc<dyn FileReader>,
        chunker: Arc<dyn Chunker>,
        client: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        observer: Arc<dyn StatusObserver>,
        options: &PipelineOptions,
    ) -> Self {
        let stages: Vec<Arc<dyn TaskChain>> = vec![
            Arc::new(ChunkStage::new(reader, chunker, options.stage_workers)),
            Arc::new(EmbedStage::new(
                client,
                options.stage_workers,
                options.embed_requests,
            )),
            Arc::new(PersistStage::new(
                store,
                options.stage_workers,
                options.index_threshold,
                options.metric,
            )),
        ];
        Self::new(stages, observer)
    }

    /// Run the chain for one file on a new task.
    pub fn process(
        self: &Arc<Self>,
        meta: LocalFileMeta,
        config: EmbeddingConfig,
    ) -> JoinHandle<TaskInfo> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run(meta, config).await })
    }

    /// Run the chain for one file to completion and return its final
    /// [`TaskInfo`].
    pub async fn run(&self, meta: LocalFileMeta, config: EmbeddingConfig) -> TaskInfo {
        let mut info = TaskInfo::new(meta, config);
        let (run_id, cancel) = self.register(info.file_id());

        let Some(first) = self.stages.first().map(|s| s.task_id()) else {
            self.deregister(run_id);
            return info;
        };
        self.record(&mut info, TaskStatus::pending(first), false);

        if let Err(e) = info.config.validate() {
            self.next(&mut info, TaskStatus::from_error(first, &e), true);
            self.deregister(run_id);
            return info;
        }

        let last_index = self.stages.len() - 1;
        for (i, stage) in self.stages.iter().enumerate() {
            self.record(&mut info, TaskStatus::processing(stage.task_id()), false);
            let status = if cancel.is_cancelled() {
                TaskStatus::from_error(stage.task_id(), &RagError::Aborted)
            } else {
                stage.process(&mut info, cancel.clone()).await
            };
            if !self.next(&mut info, status, i == last_index) {
                break;
            }
        }

        self.deregister(run_id);
        info
    }

    /// Record a stage result and decide whether the chain continues.
    ///
    /// Called exactly once per executed stage.
    pub fn next(&self, info: &mut TaskInfo, status: TaskStatus, last: bool) -> bool {
        let proceed = status.state == TaskState::Success && !last;
        match status.state {
            TaskState::Success => info!(
                file_id = %info.file_id(),
                stage = %status.stage_id,
                message = status.message.as_deref().unwrap_or(""),
                "stage succeeded"
            ),
            TaskState::Aborted => info!(
                file_id = %info.file_id(),
                stage = %status.stage_id,
                "stage aborted"
            ),
            _ => warn!(
                file_id = %info.file_id(),
                stage = %status.stage_id,
                code = status.code.unwrap_or(0),
                message = status.message.as_deref().unwrap_or(""),
                "stage failed"
            ),
        }
        self.record(info, status, !proceed);
        proceed
    }

    /// Cancel runs for one file (or all runs) and fan out to every stage.
    pub fn stop(&self, meta: Option<&LocalFileMeta>) {
        if let Ok(runs) = self.runs.lock() {
            for run in runs.values() {
                if meta.map_or(true, |m| m.id == run.file_id) {
                    run.cancel.cancel();
                }
            }
        }
        for stage in &self.stages {
            stage.stop(meta);
        }
    }

    /// Runs currently in flight.
    pub fn active_runs(&self) -> usize {
        self.runs.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn record(&self, info: &mut TaskInfo, status: TaskStatus, finished: bool) {
        let event = IngestEvent::from_status(info.file_id(), &status, finished);
        info.status_log.push(status);
        self.observer.publish(RagEvent::Ingest(event));
    }

    fn register(&self, file_id: &str) -> (u64, CancellationToken) {
        let id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(
                id,
                RunEntry {
                    file_id: file_id.to_string(),
                    cancel: cancel.clone(),
                },
            );
        }
        (id, cancel)
    }

    fn deregister(&self, id: u64) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(&id);
        }
    }
}
