//! Core data models used throughout ragdock.
//!
//! These types represent the projects, assets, chunks, and retrieval results
//! that flow through the indexing and answering pipeline. Vector-store and
//! ledger records live next to the code that owns them
//! ([`crate::store`], [`crate::ledger`]).

use serde::{Deserialize, Serialize};

/// A logical document corpus. `project_id` is the caller-facing numeric id.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub project_id: i64,
    pub project_uuid: String,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

/// An uploaded source document.
#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub asset_id: i64,
    pub asset_project_id: i64,
    pub asset_type: String,
    pub asset_name: String,
    pub asset_size: i64,
    pub asset_config: serde_json::Value,
    pub created_at: i64,
}

/// Asset types known to the file processing job.
pub const ASSET_TYPE_FILE: &str = "file";

/// A chunk of an asset's text as stored in SQLite.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub chunk_id: i64,
    pub chunk_text: String,
    pub chunk_metadata: serde_json::Value,
    pub chunk_order: i64,
    pub chunk_project_id: i64,
    pub chunk_asset_id: i64,
}

/// A chunk that has not been persisted yet.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub chunk_text: String,
    pub chunk_metadata: serde_json::Value,
    pub chunk_order: i64,
    pub chunk_project_id: i64,
    pub chunk_asset_id: i64,
}

/// A chunk returned by a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedDocument {
    /// Id of the source chunk.
    pub chunk_id: i64,
    pub text: String,
    pub score: f64,
}
