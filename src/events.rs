//! Status events published by ingestion and search.
//!
//! Every pipeline status transition becomes an [`IngestEvent`] keyed by file
//! id; every resolved search becomes a [`SearchEvent`] keyed by session id.
//! Both are delivered through a [`StatusObserver`].

use serde::Serialize;
use tokio::sync::broadcast;

use convo_rag_core::models::{ChunkRecord, SearchState, SearchTask, TaskState, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestEvent {
    pub stage_id: String,
    pub file_id: String,
    pub state: TaskState,
    pub code: Option<u16>,
    pub message: Option<String>,
    /// True on the last event of a run.
    pub finished: bool,
}

impl IngestEvent {
    pub fn from_status(file_id: &str, status: &TaskStatus, finished: bool) -> Self {
        Self {
            stage_id: status.stage_id.clone(),
            file_id: file_id.to_string(),
            state: status.state,
            code: status.code,
            message: status.message.clone(),
            finished,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchEvent {
    pub session_id: String,
    pub state: SearchState,
    pub code: Option<u16>,
    pub message: Option<String>,
    pub result: Vec<ChunkRecord>,
}

impl From<&SearchTask> for SearchEvent {
    fn from(task: &SearchTask) -> Self {
        Self {
            session_id: task.session_id.clone(),
            state: task.state,
            code: task.code,
            message: task.message.clone(),
            result: task.result.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum RagEvent {
    Ingest(IngestEvent),
    Search(SearchEvent),
}

/// Receives every status change. Implementations must not block.
pub trait StatusObserver: Send + Sync {
    fn publish(&self, event: RagEvent);
}

/// Fans events out to any number of [`broadcast::Receiver`]s.
///
/// Events published while nobody is subscribed are dropped; slow
/// subscribers lag rather than stall publishers.
pub struct BroadcastObserver {
    tx: broadcast::Sender<RagEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RagEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastObserver {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl StatusObserver for BroadcastObserver {
    fn publish(&self, event: RagEvent) {
        let _ = self.tx.send(event);
    }
}

/// Discards every event.
pub struct NoopObserver;

impl StatusObserver for NoopObserver {
    fn publish(&self, _event: RagEvent) {}
}
