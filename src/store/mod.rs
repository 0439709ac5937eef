//! Vector store abstraction for ragdock.
//!
//! The [`VectorStore`] trait is the capability contract every backend
//! implements: collection lifecycle, batched insert keyed by chunk id, and
//! similarity search. Two backends ship with the crate:
//!
//! | Backend | Module | Mechanics |
//! |---------|--------|-----------|
//! | `embedded` | [`embedded`] | single process, JSON files per collection, brute-force scoring |
//! | `pgvector` | [`pgvector`] | one Postgres table per collection, HNSW index built lazily |
//!
//! # Result discipline
//!
//! | Operation | Absent collection | Bad input |
//! |-----------|-------------------|-----------|
//! | `is_collection_exist` | `false` | n/a |
//! | `create_collection` | created, `Ok(true)` | `Validation` for `dim == 0` |
//! | `delete_collection` | no-op, `Ok(())` | n/a |
//! | `get_collection_info` | `Ok(None)` | n/a |
//! | `insert_many` | `Err(NotFound)` | `Err(Validation)` for length mismatch |
//! | `delete_records` | `Ok(0)` | n/a |
//! | `search_by_vector` | `Ok(vec![])` | `Err(Validation)` for `limit == 0` |
//! | `create_vector_index` | `Ok(false)` | n/a |
//!
//! Backend I/O failures surface as [`RagError::Provider`].
//!
//! Record identity is the source chunk id. Both backends upsert on it, so
//! re-inserting a chunk replaces the previous vector instead of duplicating it.

pub mod embedded;
pub mod pgvector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use crate::config::VectorDbConfig;
use crate::error::{RagError, Result};
use crate::models::RetrievedDocument;

pub use embedded::EmbeddedStore;
pub use pgvector::PgVectorStore;

/// Similarity metric of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMethod {
    Cosine,
    Dot,
}

impl DistanceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMethod::Cosine => "cosine",
            DistanceMethod::Dot => "dot",
        }
    }
}

impl FromStr for DistanceMethod {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(DistanceMethod::Cosine),
            "dot" => Ok(DistanceMethod::Dot),
            other => Err(RagError::config(format!(
                "unknown distance method '{}'",
                other
            ))),
        }
    }
}

/// One stored embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: serde_json::Value,
    pub chunk_id: i64,
}

/// Structural metadata of an existing collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub backend: String,
    /// Vector size, when the backend can report it.
    pub dimension: Option<usize>,
    pub distance: DistanceMethod,
    pub record_count: u64,
    /// Name of the approximate index, if one has been built.
    pub vector_index: Option<String>,
}

/// Abstract vector storage backend.
///
/// All operations are async (via `async-trait`) and implementations must be
/// `Send + Sync` so one store can be shared across the serving path and the
/// worker pool. See the module docs for the result discipline of each call.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Short backend identifier (`"embedded"`, `"pgvector"`).
    fn backend_name(&self) -> &'static str;

    /// Acquire backend resources. Failure is fatal to the owning process.
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Never fails; backend errors are logged and reported as `false`.
    async fn is_collection_exist(&self, name: &str) -> bool;

    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Create `name` if absent; with `do_reset`, drop it first. Returns
    /// whether a new collection was created.
    async fn create_collection(&self, name: &str, dim: usize, do_reset: bool) -> Result<bool>;

    /// Idempotent drop.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    async fn get_collection_info(&self, name: &str) -> Result<Option<CollectionInfo>>;

    /// Insert records in batches of `batch_size`, each batch atomic, then try
    /// to build the approximate index. Returns the number of records written.
    ///
    /// `metadata` may be `None` or empty, in which case every record gets an
    /// empty object.
    async fn insert_many(
        &self,
        name: &str,
        texts: &[String],
        vectors: &[Vec<f32>],
        metadata: Option<&[serde_json::Value]>,
        ids: &[i64],
        batch_size: usize,
    ) -> Result<usize>;

    async fn insert_one(
        &self,
        name: &str,
        text: &str,
        vector: &[f32],
        metadata: Option<serde_json::Value>,
        id: i64,
    ) -> Result<usize> {
        let metadata = metadata.map(|m| vec![m]);
        self.insert_many(
            name,
            &[text.to_string()],
            &[vector.to_vec()],
            metadata.as_deref(),
            &[id],
            1,
        )
        .await
    }

    /// Remove the records of the given chunk ids. Unknown ids are skipped.
    /// Returns the number of records removed.
    async fn delete_records(&self, name: &str, ids: &[i64]) -> Result<usize>;

    /// Top `limit` records by descending score.
    async fn search_by_vector(
        &self,
        name: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<RetrievedDocument>>;

    /// Build the approximate index if the collection is large enough and no
    /// index exists yet. Returns whether one was built.
    async fn create_vector_index(&self, name: &str) -> Result<bool>;

    /// Drop and rebuild the approximate index, subject to the same threshold.
    async fn reset_vector_index(&self, name: &str) -> Result<bool>;
}

/// Zip the parallel insert arrays into records, validating their lengths.
pub fn build_records(
    texts: &[String],
    vectors: &[Vec<f32>],
    metadata: Option<&[serde_json::Value]>,
    ids: &[i64],
) -> Result<Vec<VectorRecord>> {
    if texts.len() != vectors.len() || texts.len() != ids.len() {
        return Err(RagError::validation(format!(
            "mismatched batch lengths: {} texts, {} vectors, {} ids",
            texts.len(),
            vectors.len(),
            ids.len()
        )));
    }

    let metadata = metadata.filter(|m| !m.is_empty());
    if let Some(m) = metadata {
        if m.len() != texts.len() {
            return Err(RagError::validation(format!(
                "mismatched batch lengths: {} texts, {} metadata entries",
                texts.len(),
                m.len()
            )));
        }
    }

    let records = texts
        .iter()
        .zip(vectors)
        .zip(ids)
        .enumerate()
        .map(|(i, ((text, vector), id))| VectorRecord {
            text: text.clone(),
            vector: vector.clone(),
            metadata: metadata
                .map(|m| m[i].clone())
                .filter(|v| !v.is_null())
                .unwrap_or_else(|| serde_json::json!({})),
            chunk_id: *id,
        })
        .collect();

    Ok(records)
}

pub(crate) fn check_batch_size(batch_size: usize) -> Result<()> {
    if batch_size == 0 {
        return Err(RagError::validation("batch_size must be > 0"));
    }
    Ok(())
}

pub(crate) fn check_limit(limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(RagError::validation("limit must be > 0"));
    }
    Ok(())
}

/// Build the configured backend and connect it.
pub async fn create_store(config: &VectorDbConfig) -> Result<Arc<dyn VectorStore>> {
    let distance = DistanceMethod::from_str(&config.distance)?;

    let store: Arc<dyn VectorStore> = match config.backend.as_str() {
        "embedded" => Arc::new(EmbeddedStore::open(&config.path, distance)),
        "pgvector" => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| RagError::config("vector_db.url required for pgvector"))?;
            Arc::new(PgVectorStore::new(url, distance, config.index_threshold)?)
        }
        other => {
            return Err(RagError::config(format!(
                "unknown vector_db backend '{}'",
                other
            )))
        }
    };

    store.connect().await?;
    tracing::info!(backend = store.backend_name(), "vector store connected");
    Ok(store)
}
