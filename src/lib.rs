//! Conversational data exploration over tabular files.
//!
//! The pipeline: import SQLite/CSV/TSV files into an in-memory store,
//! derive a per-column catalog, extract structured filters from a free
//! text requirement through a streaming chat model, resolve fuzzy values
//! against the actual column contents with a similarity service, and
//! compile the accepted filters into per-table SQL whose key columns are
//! intersected.

pub mod catalog;
pub mod compiler;
pub mod config;
pub mod conversation;
pub mod error;
pub mod filters;
pub mod ingest;
pub mod llm;
pub mod session;
pub mod similarity;
pub mod store;

pub use error::{DataChatError, Result};
pub use session::Session;
