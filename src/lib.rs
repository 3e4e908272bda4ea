//! # convo-rag
//!
//! Per-conversation retrieval core: ingest local files into scoped vector
//! tables and answer cancellable, session-bound similarity searches.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────────────────┐   ┌──────────────┐
//! │ LocalFile  │──▶│ Chunk → Embed → Persist │──▶│ VectorStore  │
//! │   Meta     │   │      (TaskManager)      │   │ SQLite + ANN │
//! └────────────┘   └───────────┬─────────────┘   └──────┬───────┘
//!                              │ events                 │
//!                              ▼                        ▼
//!                        ┌───────────┐          ┌───────────────┐
//!                        │ RagEvent  │◀─────────│ SearchManager │
//!                        │ broadcast │          │  (sessions)   │
//!                        └───────────┘          └───────────────┘
//! ```
//!
//! [`service::RagService`] ties the pieces together; the `crag` binary is a
//! thin CLI over it.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`service`] | Facade over pipeline, search and store |
//! | [`pipeline`] | Chunk, embed and persist stages |
//! | [`search`] | Session-scoped search with rerank |
//! | [`embedding`] | Embedding and rerank HTTP client |
//! | [`sqlite_store`] | SQLite-backed vector store |
//! | [`ann`] | HNSW candidate index |
//! | [`reader`] | Local file reading |
//! | [`events`] | Status events and observers |
//! | [`progress`] | CLI progress rendering |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod ann;
pub mod cancel;
pub mod config;
pub mod db;
pub mod embedding;
pub mod events;
pub mod migrate;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod search;
pub mod service;
pub mod sqlite_store;
