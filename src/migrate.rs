use anyhow::Result;
use sqlx::SqlitePool;

/// Create every relational table ragdock needs. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            project_id INTEGER PRIMARY KEY,
            project_uuid TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL,
            updated_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS assets (
            asset_id INTEGER PRIMARY KEY AUTOINCREMENT,
            asset_project_id INTEGER NOT NULL,
            asset_type TEXT NOT NULL,
            asset_name TEXT NOT NULL,
            asset_size INTEGER NOT NULL,
            asset_config TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            UNIQUE(asset_project_id, asset_name),
            FOREIGN KEY (asset_project_id) REFERENCES projects(project_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            chunk_id INTEGER PRIMARY KEY AUTOINCREMENT,
            chunk_text TEXT NOT NULL,
            chunk_metadata TEXT NOT NULL DEFAULT '{}',
            chunk_order INTEGER NOT NULL,
            chunk_project_id INTEGER NOT NULL,
            chunk_asset_id INTEGER NOT NULL,
            FOREIGN KEY (chunk_project_id) REFERENCES projects(project_id) ON DELETE CASCADE,
            FOREIGN KEY (chunk_asset_id) REFERENCES assets(asset_id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Job ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_executions (
            execution_id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_name TEXT NOT NULL,
            task_args_hash TEXT NOT NULL,
            task_args TEXT NOT NULL DEFAULT '{}',
            correlation_id TEXT NOT NULL,
            status TEXT NOT NULL,
            result TEXT,
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_project_id ON chunks(chunk_project_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_chunks_asset_order ON chunks(chunk_asset_id, chunk_order)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_assets_type ON assets(asset_type)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_executions_lookup \
         ON task_executions(task_name, task_args_hash, correlation_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_task_executions_created_at ON task_executions(created_at)",
    )
    .execute(pool)
    .await?;

    tracing::debug!("migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = db::connect_in_memory().await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, vec!["assets", "chunks", "projects", "task_executions"]);
    }
}
