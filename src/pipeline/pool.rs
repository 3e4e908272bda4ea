//! Per-stage worker pool.
//!
//! Bounds how many files a stage works on at once. Files waiting for a slot
//! stay registered so [`StagePool::stop`] can cancel them before they start.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use convo_rag_core::error::{RagError, Result};

type Active = Arc<Mutex<HashMap<u64, (String, CancellationToken)>>>;

pub struct StagePool {
    permits: Arc<Semaphore>,
    active: Active,
    seq: AtomicU64,
}

impl StagePool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            active: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// Wait for a free worker slot for `file_id`.
    ///
    /// The returned ticket carries a child of `cancel` that also fires on
    /// [`stop`](Self::stop); stages should run their work against it.
    pub async fn enter(&self, file_id: &str, cancel: &CancellationToken) -> Result<PoolTicket> {
        let token = cancel.child_token();
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut active) = self.active.lock() {
            active.insert(id, (file_id.to_string(), token.clone()));
        }
        let ticket_guard = Deregister {
            id,
            active: self.active.clone(),
        };

        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(RagError::Aborted),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| RagError::Aborted)?
            }
        };

        Ok(PoolTicket {
            _permit: permit,
            token,
            _guard: ticket_guard,
        })
    }

    /// Cancel queued and running work for `file_id`, or for every file.
    pub fn stop(&self, file_id: Option<&str>) {
        if let Ok(active) = self.active.lock() {
            for (fid, token) in active.values() {
                if file_id.map_or(true, |wanted| wanted == fid) {
                    token.cancel();
                }
            }
        }
    }

    /// Files currently queued or running.
    pub fn active_count(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }
}

struct Deregister {
    id: u64,
    active: Active,
}

impl Drop for Deregister {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.id);
        }
    }
}

/// A held worker slot. Dropping it frees the slot.
pub struct PoolTicket {
    _permit: OwnedSemaphorePermit,
    token: CancellationToken,
    _guard: Deregister,
}

impl PoolTicket {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn queued_file_can_be_stopped() {
        let pool = Arc::new(StagePool::new(1));
        let root = CancellationToken::new();
        let held = pool.enter("a", &root).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            let root = root.clone();
            tokio::spawn(async move { pool.enter("b", &root).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.active_count(), 2);

        pool.stop(Some("b"));
        assert_eq!(waiter.await.unwrap(), Err(RagError::Aborted));
        assert!(!held.token().is_cancelled());

        drop(held);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn stop_all_cancels_running_tickets() {
        let pool = StagePool::new(2);
        let root = CancellationToken::new();
        let a = pool.enter("a", &root).await.unwrap();
        let b = pool.enter("b", &root).await.unwrap();
        pool.stop(None);
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
        assert!(!root.is_cancelled());
    }
}
