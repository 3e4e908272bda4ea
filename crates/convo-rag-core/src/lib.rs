//! # convo-rag core
//!
//! Shared, runtime-agnostic logic for convo-rag: data models, the error
//! type with its status codes, paragraph chunking, vector scoring, and the
//! [`VectorStore`](store::VectorStore) abstraction with an in-memory backend.
//!
//! This crate contains no tokio, sqlx, or HTTP dependencies. The app crate
//! (`convo-rag`) supplies the SQLite store, the embedding client, the
//! ingestion pipeline and the search manager.

pub mod chunk;
pub mod error;
pub mod models;
pub mod store;
pub mod vector;

pub use error::{RagError, Result};
