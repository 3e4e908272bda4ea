//! Session-scoped similarity search.
//!
//! [`SearchManager`] answers a free-text query against one or more scopes,
//! each paired with the embedding config its table was built with:
//!
//! 1. embed the query once per scope, concurrently
//! 2. search every scope's table for `top_k` candidates, concurrently
//! 3. scopes with a rerank endpoint contribute their single most relevant
//!    candidate; when no scope reranks, all candidates are merged and
//!    sorted by descending similarity
//!
//! Each session id has at most one live search. A new submission for a
//! session cancels the pending one and waits until it has settled before
//! calling any endpoint, so results for a session resolve in submission
//! order. The resolved [`SearchTask`] stays in the session map until a
//! caller consumes it with [`get_result`](SearchManager::get_result) or it
//! is evicted: at most [`DEFAULT_RETAINED_RESULTS`] settled, unconsumed
//! results are kept (see [`SearchManager::with_retained_results`]), oldest
//! submission dropped first. Callers that only follow search events never
//! need to call `get_result`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use convo_rag_core::error::{RagError, Result};
use convo_rag_core::models::{
    ChunkRecord, EndpointConfig, ScopedConfig, SearchParam, SearchState, SearchTask,
};
use convo_rag_core::store::VectorStore;

use crate::cancel::cancellable;
use crate::embedding::{check_embeddings, EmbeddingClient};
use crate::events::{RagEvent, SearchEvent, StatusObserver};

/// Settled results kept for `get_result` before the oldest are dropped.
pub const DEFAULT_RETAINED_RESULTS: usize = 1024;

struct SessionSlot {
    generation: u64,
    cancel: CancellationToken,
    state: watch::Receiver<SearchTask>,
}

pub struct SearchManager {
    client: Arc<dyn EmbeddingClient>,
    store: Arc<dyn VectorStore>,
    observer: Arc<dyn StatusObserver>,
    top_k: usize,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    generation: AtomicU64,
    retained_results: usize,
}

impl SearchManager {
    pub fn new(
        client: Arc<dyn EmbeddingClient>,
        store: Arc<dyn VectorStore>,
        observer: Arc<dyn StatusObserver>,
        top_k: usize,
    ) -> Self {
        Self {
            client,
            store,
            observer,
            top_k: top_k.max(1),
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            retained_results: DEFAULT_RETAINED_RESULTS,
        }
    }

    /// Keep at most `limit` settled, unconsumed results (minimum one).
    pub fn with_retained_results(mut self, limit: usize) -> Self {
        self.retained_results = limit.max(1);
        self
    }

    /// Register a pending search for `param.session_id` and start it.
    ///
    /// The handle resolves with the terminal task; callers that only need
    /// the result later use [`get_result`](Self::get_result).
    pub fn start_search(self: &Arc<Self>, param: SearchParam) -> Result<JoinHandle<SearchTask>> {
        let (tx, rx) = watch::channel(SearchTask::pending(&param));
        let cancel = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;

        let previous = {
            let mut sessions = self.lock_sessions()?;
            sessions.insert(
                param.session_id.clone(),
                SessionSlot {
                    generation,
                    cancel: cancel.clone(),
                    state: rx,
                },
            )
        };
        let previous = previous.map(|slot| {
            if !slot.state.borrow().state.is_terminal() {
                debug!(session_id = %param.session_id, "superseding pending search");
                slot.cancel.cancel();
            }
            slot.state
        });

        let manager = self.clone();
        Ok(tokio::spawn(async move {
            if let Some(mut earlier) = previous {
                // Sender dropped also counts as settled.
                let _ = earlier.wait_for(|t| t.state.is_terminal()).await;
            }

            let outcome = manager.execute(&param, &cancel).await;
            let task = manager.resolve(&param, &cancel, outcome, &tx);
            match task.state {
                SearchState::Success => info!(
                    session_id = %task.session_id,
                    results = task.result.len(),
                    "search complete"
                ),
                SearchState::Aborted => info!(session_id = %task.session_id, "search aborted"),
                _ => warn!(
                    session_id = %task.session_id,
                    code = task.code.unwrap_or(0),
                    message = task.message.as_deref().unwrap_or(""),
                    "search failed"
                ),
            }

            manager
                .observer
                .publish(RagEvent::Search(SearchEvent::from(&task)));
            task
        }))
    }

    /// Wait for the session's search to settle and consume it.
    ///
    /// Fails immediately with [`RagError::TaskNotFound`] when the session
    /// has no registered search.
    pub async fn get_result(&self, session_id: &str) -> Result<SearchTask> {
        let (generation, mut state) = {
            let sessions = self.lock_sessions()?;
            let slot = sessions
                .get(session_id)
                .ok_or_else(|| RagError::TaskNotFound(session_id.to_string()))?;
            (slot.generation, slot.state.clone())
        };

        let settled = state
            .wait_for(|t| t.state.is_terminal())
            .await
            .map(|t| t.clone());
        let task = match settled {
            Ok(task) => task,
            Err(_) => {
                let mut task = state.borrow().clone();
                task.fail(&RagError::Aborted);
                task
            }
        };

        let mut sessions = self.lock_sessions()?;
        if sessions
            .get(session_id)
            .is_some_and(|slot| slot.generation == generation)
        {
            sessions.remove(session_id);
        }
        Ok(task)
    }

    /// Cancel the session's pending search.
    ///
    /// Returns true only when the search was still pending; it then
    /// resolves as [`SearchState::Aborted`]. Returns false when the session
    /// has no search or it has already settled.
    pub fn stop_search(&self, session_id: &str) -> bool {
        let Ok(sessions) = self.lock_sessions() else {
            return false;
        };
        match sessions.get(session_id) {
            Some(slot) if !slot.state.borrow().state.is_terminal() => {
                slot.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every registered search.
    pub fn stop_all(&self) {
        if let Ok(sessions) = self.lock_sessions() {
            for slot in sessions.values() {
                slot.cancel.cancel();
            }
        }
    }

    /// Sessions with a registered (pending or unconsumed) search.
    pub fn session_count(&self) -> usize {
        self.lock_sessions().map(|s| s.len()).unwrap_or(0)
    }

    fn lock_sessions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, SessionSlot>>> {
        self.sessions
            .lock()
            .map_err(|_| RagError::Store("search session map lock poisoned".to_string()))
    }

    /// Turn the run's outcome into the terminal task and publish it on the
    /// session's channel, under the session lock shared with
    /// [`stop_search`](Self::stop_search).
    fn resolve(
        &self,
        param: &SearchParam,
        cancel: &CancellationToken,
        outcome: Result<Vec<ChunkRecord>>,
        tx: &watch::Sender<SearchTask>,
    ) -> SearchTask {
        let mut sessions = self.lock_sessions();
        let mut task = SearchTask::pending(param);
        match outcome {
            Ok(_) if cancel.is_cancelled() => task.fail(&RagError::Aborted),
            Ok(result) => task.succeed(result),
            Err(e) => task.fail(&e),
        }
        tx.send_replace(task.clone());
        if let Ok(sessions) = sessions.as_mut() {
            evict_settled(sessions, self.retained_results);
        }
        task
    }

    async fn execute(
        &self,
        param: &SearchParam,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkRecord>> {
        if cancel.is_cancelled() {
            return Err(RagError::Aborted);
        }
        if param.content.trim().is_empty() {
            return Err(RagError::InvalidInput("search query is empty".to_string()));
        }
        if param.configs.is_empty() {
            return Err(RagError::InvalidInput(
                "search needs at least one scope".to_string(),
            ));
        }
        for scoped in &param.configs {
            scoped.config.validate()?;
        }

        let vectors = settle(
            join_all(
                param
                    .configs
                    .iter()
                    .map(|scoped| self.embed_query(scoped, &param.content, cancel)),
            )
            .await,
        )?;

        cancellable(cancel, self.store.open()).await?;
        let candidates = settle(
            join_all(param.configs.iter().zip(vectors.iter()).map(|(scoped, vector)| {
                cancellable(cancel, self.store.search(&scoped.scope, vector, self.top_k))
            }))
            .await,
        )?;

        let reranking = param.configs.iter().any(|s| s.config.rerank.is_some());
        if !reranking {
            let mut merged: Vec<ChunkRecord> = candidates.into_iter().flatten().collect();
            merged.sort_by(|a, b| {
                b.distance
                    .partial_cmp(&a.distance)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            return Ok(merged);
        }

        let picks = settle(
            join_all(
                param
                    .configs
                    .iter()
                    .zip(candidates)
                    .filter_map(|(scoped, hits)| {
                        scoped
                            .config
                            .rerank
                            .as_ref()
                            .map(|endpoint| self.rerank_best(endpoint, &param.content, hits, cancel))
                    }),
            )
            .await,
        )?;

        let mut best: Vec<ChunkRecord> = picks.into_iter().flatten().collect();
        best.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(best)
    }

    async fn embed_query(
        &self,
        scoped: &ScopedConfig,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<f32>> {
        let inputs = [content.to_string()];
        let vectors = cancellable(cancel, self.client.embed(&scoped.config, &inputs)).await?;
        check_embeddings(&scoped.config, 1, &vectors)?;
        vectors.into_iter().next().ok_or_else(|| {
            RagError::Malformed(format!(
                "model '{}' returned no embedding for scope '{}'",
                scoped.config.model, scoped.scope
            ))
        })
    }

    /// The single candidate the rerank endpoint scores highest, if any.
    async fn rerank_best(
        &self,
        endpoint: &EndpointConfig,
        query: &str,
        mut hits: Vec<ChunkRecord>,
        cancel: &CancellationToken,
    ) -> Result<Option<ChunkRecord>> {
        if hits.is_empty() {
            return Ok(None);
        }
        let documents: Vec<String> = hits.iter().map(|h| h.content.clone()).collect();
        let scores = cancellable(cancel, self.client.rerank(endpoint, query, &documents)).await?;

        let Some(top) = scores.iter().max_by(|a, b| {
            a.relevance_score
                .partial_cmp(&b.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            return Ok(None);
        };
        if top.index >= hits.len() {
            return Err(RagError::Malformed(format!(
                "rerank model '{}' returned index {} for {} documents",
                endpoint.model,
                top.index,
                hits.len()
            )));
        }

        let mut pick = hits.swap_remove(top.index);
        pick.relevance = Some(top.relevance_score);
        Ok(Some(pick))
    }
}

/// Drop the oldest settled slots beyond `limit`. Pending slots stay.
fn evict_settled(sessions: &mut HashMap<String, SessionSlot>, limit: usize) {
    let mut settled: Vec<(u64, String)> = sessions
        .iter()
        .filter(|(_, slot)| slot.state.borrow().state.is_terminal())
        .map(|(id, slot)| (slot.generation, id.clone()))
        .collect();
    if settled.len() <= limit {
        return;
    }
    settled.sort_unstable();
    let excess = settled.len() - limit;
    for (_, id) in settled.into_iter().take(excess) {
        debug!(session_id = %id, "evicting unconsumed search result");
        sessions.remove(&id);
    }
}

/// Collapse per-scope results: any cancellation wins, otherwise the first
/// error in scope order.
fn settle<T>(results: Vec<Result<T>>) -> Result<Vec<T>> {
    if results
        .iter()
        .any(|r| matches!(r, Err(e) if e.is_aborted()))
    {
        return Err(RagError::Aborted);
    }
    results.into_iter().collect()
}
