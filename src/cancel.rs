//! Cancellation helpers shared by the pipeline and the search manager.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use convo_rag_core::error::{RagError, Result};

/// Run `fut` unless `cancel` fires first, in which case the future is
/// dropped and [`RagError::Aborted`] is returned.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(RagError::Aborted);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RagError::Aborted),
        result = fut => result,
    }
}
