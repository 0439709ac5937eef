//! Indexing orchestration: embed chunks and write them into the vector store.
//!
//! ```text
//!   ChunkRepository ──page──▶ IndexingOrchestrator ──embed──▶ Embedder
//!                                     │
//!                                     └──create/insert/index──▶ VectorStore
//! ```
//!
//! The collection for a project is always `collection_name(embedder.dims(),
//! project_id)`, so switching embedding models never mixes vector sizes in
//! one collection. Records are keyed by chunk id, which makes re-running an
//! indexing job (with reset disabled) replace rather than duplicate records.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::{EmbedPurpose, Embedder};
use crate::error::{RagError, Result};
use crate::models::{Chunk, Project};
use crate::namer::collection_name;
use crate::repository::ChunkRepository;
use crate::store::{CollectionInfo, VectorStore};

/// What `info` reports for a project, whether or not it has been indexed.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionStatus {
    pub collection_name: String,
    pub exists: bool,
    pub record_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<CollectionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of a full-project indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub collection_name: String,
    pub inserted_items_count: usize,
    pub pages: usize,
    pub index_created: bool,
}

pub struct IndexingOrchestrator {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    insert_batch_size: usize,
}

impl IndexingOrchestrator {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        insert_batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            insert_batch_size: insert_batch_size.max(1),
        }
    }

    pub fn collection_name(&self, project: &Project) -> String {
        collection_name(self.embedder.dims(), project.project_id)
    }

    /// Drop the project's collection; the next index run recreates it.
    pub async fn reset_collection(&self, project: &Project) -> Result<()> {
        let name = self.collection_name(project);
        self.store.delete_collection(&name).await?;
        info!(project_id = project.project_id, collection = %name, "collection reset");
        Ok(())
    }

    /// Drop the vectors of deleted chunks from the project's collection.
    pub async fn remove_chunks(&self, project: &Project, chunk_ids: &[i64]) -> Result<usize> {
        if chunk_ids.is_empty() {
            return Ok(0);
        }
        let name = self.collection_name(project);
        let removed = self.store.delete_records(&name, chunk_ids).await?;
        debug!(collection = %name, removed, "stale chunk vectors removed");
        Ok(removed)
    }

    /// Collection metadata, or an explicit "not indexed yet" status.
    pub async fn collection_info(&self, project: &Project) -> Result<CollectionStatus> {
        let name = self.collection_name(project);
        let info = if self.store.is_collection_exist(&name).await {
            self.store.get_collection_info(&name).await?
        } else {
            None
        };

        Ok(match info {
            Some(info) => CollectionStatus {
                collection_name: name,
                exists: true,
                record_count: info.record_count,
                info: Some(info),
                message: None,
            },
            None => {
                warn!(project_id = project.project_id, collection = %name, "collection does not exist");
                CollectionStatus {
                    collection_name: name,
                    exists: false,
                    record_count: 0,
                    info: None,
                    message: Some(
                        "Collection not found - may need to index documents first".to_string(),
                    ),
                }
            }
        })
    }

    /// Embed `chunks` in one call and upsert them under `chunk_ids`.
    /// Returns the number of records written.
    pub async fn index_into_store(
        &self,
        project: &Project,
        chunk_ids: &[i64],
        chunks: &[Chunk],
        do_reset: bool,
    ) -> Result<usize> {
        if chunk_ids.len() != chunks.len() {
            return Err(RagError::validation(format!(
                "{} chunk ids for {} chunks",
                chunk_ids.len(),
                chunks.len()
            )));
        }

        let name = self.collection_name(project);
        let dim = self.embedder.dims();

        if chunks.is_empty() {
            self.store.create_collection(&name, dim, do_reset).await?;
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.chunk_text.clone()).collect();
        let metadata: Vec<serde_json::Value> =
            chunks.iter().map(|c| c.chunk_metadata.clone()).collect();

        let vectors = self.embedder.embed(&texts, EmbedPurpose::Document).await?;
        if vectors.len() != texts.len() {
            return Err(RagError::provider(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }
        debug!(collection = %name, count = vectors.len(), "chunks embedded");

        self.store.create_collection(&name, dim, do_reset).await?;
        let inserted = self
            .store
            .insert_many(
                &name,
                &texts,
                &vectors,
                Some(&metadata),
                chunk_ids,
                self.insert_batch_size,
            )
            .await?;

        info!(collection = %name, inserted, "chunks indexed");
        Ok(inserted)
    }

    /// Index every chunk of `project`, one page at a time, then build the
    /// vector index once at the end.
    ///
    /// `do_reset` is applied once, before the first page, so later pages do
    /// not wipe what earlier pages wrote.
    pub async fn index_project(
        &self,
        project: &Project,
        chunks: &ChunkRepository,
        page_size: usize,
        do_reset: bool,
    ) -> Result<IndexReport> {
        self.index_project_with_progress(project, chunks, page_size, do_reset, |_, _| {})
            .await
    }

    /// [`index_project`](Self::index_project), calling `on_page(inserted,
    /// total)` after each page.
    pub async fn index_project_with_progress<F>(
        &self,
        project: &Project,
        chunks: &ChunkRepository,
        page_size: usize,
        do_reset: bool,
        on_page: F,
    ) -> Result<IndexReport>
    where
        F: Fn(usize, i64) + Send + Sync,
    {
        let page_size = page_size.max(1);
        let name = self.collection_name(project);
        self.store
            .create_collection(&name, self.embedder.dims(), do_reset)
            .await?;

        let total = chunks.count(project.project_id).await?;
        info!(project_id = project.project_id, collection = %name, total, "indexing project");

        let mut page_no = 1;
        let mut inserted_items_count = 0;
        loop {
            let page = chunks.page(project.project_id, page_no, page_size).await?;
            if page.is_empty() {
                break;
            }

            let ids: Vec<i64> = page.iter().map(|c| c.chunk_id).collect();
            inserted_items_count += self.index_into_store(project, &ids, &page, false).await?;
            debug!(page_no, inserted_items_count, total, "page indexed");
            on_page(inserted_items_count, total);
            page_no += 1;
        }

        let index_created = self.store.create_vector_index(&name).await?;
        if index_created {
            info!(collection = %name, "vector index created");
        } else {
            info!(collection = %name, "vector index skipped (exists or below threshold)");
        }

        Ok(IndexReport {
            collection_name: name,
            inserted_items_count,
            pages: page_no - 1,
            index_created,
        })
    }
}
