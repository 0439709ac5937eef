//! Wiring: build every component once from a [`Config`].
//!
//! [`App`] owns the relational pool and the provider handles. Orchestrators
//! and repositories are cheap views created on demand from it, so the CLI and
//! job bodies share one set of connections.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::generation::{create_generator, Generator};
use crate::indexing::IndexingOrchestrator;
use crate::ledger::IdempotencyLedger;
use crate::repository::{AssetRepository, ChunkRepository, ProjectRepository};
use crate::retrieval::RetrievalAnswerer;
use crate::store::{create_store, VectorStore};
use crate::templates::{TemplateLookup, TemplateParser};
use crate::{db, migrate};

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
    pub templates: Arc<dyn TemplateLookup>,
}

impl App {
    /// Connect the database (running migrations), the vector store, and the
    /// providers. Any failure here is fatal for the caller.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;

        let store = create_store(&config.vector_db)
            .await
            .context("Failed to connect vector store")?;
        let embedder = create_embedder(&config.embedding)?;
        let generator = create_generator(&config.generation)?;
        let templates: Arc<dyn TemplateLookup> = Arc::new(TemplateParser::new(&config.templates)?);

        Ok(Self {
            config,
            pool,
            store,
            embedder,
            generator,
            templates,
        })
    }

    /// Assemble from already-built parts.
    pub fn from_parts(
        config: Config,
        pool: SqlitePool,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        generator: Arc<dyn Generator>,
        templates: Arc<dyn TemplateLookup>,
    ) -> Self {
        Self {
            config,
            pool,
            store,
            embedder,
            generator,
            templates,
        }
    }

    pub fn projects(&self) -> ProjectRepository {
        ProjectRepository::new(self.pool.clone())
    }

    pub fn assets(&self) -> AssetRepository {
        AssetRepository::new(self.pool.clone())
    }

    pub fn chunks(&self) -> ChunkRepository {
        ChunkRepository::new(self.pool.clone())
    }

    pub fn ledger(&self) -> IdempotencyLedger {
        IdempotencyLedger::new(self.pool.clone())
    }

    pub fn indexing(&self) -> IndexingOrchestrator {
        IndexingOrchestrator::new(
            self.store.clone(),
            self.embedder.clone(),
            self.config.vector_db.insert_batch_size,
        )
    }

    pub fn answerer(&self) -> RetrievalAnswerer {
        RetrievalAnswerer::new(
            self.store.clone(),
            self.embedder.clone(),
            self.generator.clone(),
            self.templates.clone(),
        )
    }

    pub async fn close(&self) {
        if let Err(e) = self.store.disconnect().await {
            tracing::warn!(error = %e, "vector store disconnect failed");
        }
        self.pool.close().await;
    }
}
