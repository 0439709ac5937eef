//! SQLite repositories for projects, assets, and chunks.
//!
//! Chunks are the unit the indexing path reads: [`ChunkRepository::page`]
//! walks a project's chunks in `chunk_id` order so paginated indexing visits
//! every chunk exactly once even while earlier pages are being embedded.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{RagError, Result};
use crate::models::{Asset, Chunk, NewChunk, Project};

#[derive(Clone)]
pub struct ProjectRepository {
    pool: SqlitePool,
}

impl ProjectRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch the project, creating it on first reference.
    pub async fn get_or_create(&self, project_id: i64) -> Result<Project> {
        sqlx::query(
            "INSERT INTO projects (project_id, project_uuid, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(project_id) DO NOTHING",
        )
        .bind(project_id)
        .bind(Uuid::new_v4().to_string())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT project_id, project_uuid, created_at, updated_at FROM projects WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Project {
            project_id: row.get("project_id"),
            project_uuid: row.get("project_uuid"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[derive(Clone)]
pub struct AssetRepository {
    pool: SqlitePool,
}

impl AssetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record an asset; re-registering the same name refreshes size and config.
    pub async fn upsert(
        &self,
        project_id: i64,
        asset_type: &str,
        name: &str,
        size: i64,
        config: &serde_json::Value,
    ) -> Result<Asset> {
        sqlx::query(
            r#"
            INSERT INTO assets (asset_project_id, asset_type, asset_name, asset_size, asset_config, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(asset_project_id, asset_name) DO UPDATE SET
                asset_type = excluded.asset_type,
                asset_size = excluded.asset_size,
                asset_config = excluded.asset_config
            "#,
        )
        .bind(project_id)
        .bind(asset_type)
        .bind(name)
        .bind(size)
        .bind(serde_json::to_string(config)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        self.get_by_name(project_id, name)
            .await?
            .ok_or_else(|| RagError::persistence(format!("asset {} vanished after insert", name)))
    }

    pub async fn get_by_name(&self, project_id: i64, name: &str) -> Result<Option<Asset>> {
        let row = sqlx::query(
            "SELECT asset_id, asset_project_id, asset_type, asset_name, asset_size, asset_config, created_at \
             FROM assets WHERE asset_project_id = ? AND asset_name = ?",
        )
        .bind(project_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| asset_from_row(&r)).transpose()
    }

    pub async fn list(&self, project_id: i64, asset_type: &str) -> Result<Vec<Asset>> {
        let rows = sqlx::query(
            "SELECT asset_id, asset_project_id, asset_type, asset_name, asset_size, asset_config, created_at \
             FROM assets WHERE asset_project_id = ? AND asset_type = ? ORDER BY asset_id",
        )
        .bind(project_id)
        .bind(asset_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(asset_from_row).collect()
    }
}

fn asset_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Asset> {
    let config: String = row.get("asset_config");
    Ok(Asset {
        asset_id: row.get("asset_id"),
        asset_project_id: row.get("asset_project_id"),
        asset_type: row.get("asset_type"),
        asset_name: row.get("asset_name"),
        asset_size: row.get("asset_size"),
        asset_config: serde_json::from_str(&config)?,
        created_at: row.get("created_at"),
    })
}

/// Outcome of rewriting one asset's chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkReplacement {
    pub written: usize,
    /// Chunks the new text no longer produces; already deleted from SQLite.
    pub removed_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct ChunkRepository {
    pool: SqlitePool,
}

impl ChunkRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Rewrite the chunks of one asset in a single transaction.
    ///
    /// Rows are upserted on `(chunk_asset_id, chunk_order)`, so a chunk keeps
    /// its id across reprocessing. Orders the new chunk list no longer has
    /// are deleted and their ids returned for removal from the vector store.
    pub async fn replace_for_asset(
        &self,
        asset_id: i64,
        chunks: &[NewChunk],
    ) -> Result<ChunkReplacement> {
        if let Some(stray) = chunks.iter().find(|c| c.chunk_asset_id != asset_id) {
            return Err(RagError::validation(format!(
                "chunk {} belongs to asset {}, not {}",
                stray.chunk_order, stray.chunk_asset_id, asset_id
            )));
        }

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (chunk_text, chunk_metadata, chunk_order, chunk_project_id, chunk_asset_id) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(chunk_asset_id, chunk_order) DO UPDATE SET \
                     chunk_text = excluded.chunk_text, \
                     chunk_metadata = excluded.chunk_metadata, \
                     chunk_project_id = excluded.chunk_project_id",
            )
            .bind(&chunk.chunk_text)
            .bind(serde_json::to_string(&chunk.chunk_metadata)?)
            .bind(chunk.chunk_order)
            .bind(chunk.chunk_project_id)
            .bind(asset_id)
            .execute(&mut *tx)
            .await?;
        }

        let existing: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT chunk_id, chunk_order FROM chunks WHERE chunk_asset_id = ? ORDER BY chunk_id",
        )
        .bind(asset_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut removed_ids = Vec::new();
        for (chunk_id, order) in existing {
            if chunks.iter().any(|c| c.chunk_order == order) {
                continue;
            }
            sqlx::query("DELETE FROM chunks WHERE chunk_id = ?")
                .bind(chunk_id)
                .execute(&mut *tx)
                .await?;
            removed_ids.push(chunk_id);
        }

        tx.commit().await?;
        Ok(ChunkReplacement {
            written: chunks.len(),
            removed_ids,
        })
    }

    /// One page of a project's chunks; `page_no` starts at 1.
    pub async fn page(&self, project_id: i64, page_no: usize, page_size: usize) -> Result<Vec<Chunk>> {
        let offset = page_no.saturating_sub(1) * page_size;
        let rows = sqlx::query(
            "SELECT chunk_id, chunk_text, chunk_metadata, chunk_order, chunk_project_id, chunk_asset_id \
             FROM chunks WHERE chunk_project_id = ? ORDER BY chunk_id ASC LIMIT ? OFFSET ?",
        )
        .bind(project_id)
        .bind(page_size as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let metadata: String = row.get("chunk_metadata");
                Ok(Chunk {
                    chunk_id: row.get("chunk_id"),
                    chunk_text: row.get("chunk_text"),
                    chunk_metadata: serde_json::from_str(&metadata)?,
                    chunk_order: row.get("chunk_order"),
                    chunk_project_id: row.get("chunk_project_id"),
                    chunk_asset_id: row.get("chunk_asset_id"),
                })
            })
            .collect()
    }

    pub async fn count(&self, project_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE chunk_project_id = ?")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete_by_project(&self, project_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE chunk_project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
