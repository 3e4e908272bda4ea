//! Error type shared by every convo-rag component.
//!
//! Each variant maps to an HTTP-style status code via [`RagError::code`]:
//! caller-input problems are 4xx, upstream (endpoint or store) problems are
//! 5xx, and cancellation is the distinct 499.

use thiserror::Error;

pub type Result<T, E = RagError> = std::result::Result<T, E>;

/// Status code reported for cancelled work.
pub const CODE_ABORTED: u16 = 499;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RagError {
    /// Malformed request or configuration supplied by the caller.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The source file does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// The source file produced more chunks than the config allows.
    #[error("file too large: {0}")]
    TooLarge(String),

    /// A store operation was attempted before `open()` succeeded.
    #[error("vector store not initialized")]
    NotInitialized,

    /// The scope has no backing table.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// Backing engine failure (I/O, SQL, index build).
    #[error("store error: {0}")]
    Store(String),

    /// Network or HTTP-status failure talking to an embedding/rerank endpoint.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// An endpoint answered with a payload of the wrong shape.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// No search task registered for the session.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The work was cancelled before it completed.
    #[error("aborted")]
    Aborted,
}

impl RagError {
    /// HTTP-style status code carried by status events.
    pub fn code(&self) -> u16 {
        match self {
            RagError::InvalidInput(_) => 400,
            RagError::FileNotFound(_) => 404,
            RagError::TableNotFound(_) => 404,
            RagError::TaskNotFound(_) => 404,
            RagError::TooLarge(_) => 413,
            RagError::Aborted => CODE_ABORTED,
            RagError::NotInitialized => 500,
            RagError::Store(_) => 500,
            RagError::Upstream(_) => 502,
            RagError::Malformed(_) => 502,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, RagError::Aborted)
    }

    /// True for errors caused by what the caller supplied.
    pub fn is_input_error(&self) -> bool {
        (400..500).contains(&self.code()) && !self.is_aborted()
    }
}

impl From<std::io::Error> for RagError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => RagError::FileNotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidData => {
                RagError::InvalidInput(e.to_string())
            }
            _ => RagError::Store(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_split_input_upstream_and_cancel() {
        assert_eq!(RagError::FileNotFound("a".into()).code(), 404);
        assert_eq!(RagError::InvalidInput("a".into()).code(), 400);
        assert_eq!(RagError::Upstream("a".into()).code(), 502);
        assert_eq!(RagError::NotInitialized.code(), 500);
        assert_eq!(RagError::Aborted.code(), 499);

        assert!(RagError::TooLarge("a".into()).is_input_error());
        assert!(!RagError::Aborted.is_input_error());
        assert!(!RagError::Malformed("a".into()).is_input_error());
    }

    #[test]
    fn io_not_found_maps_to_file_not_found() {
        let err: RagError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.code(), 404);
    }
}
