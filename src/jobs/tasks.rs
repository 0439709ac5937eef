//! The registered job bodies.
//!
//! | Job | Args | Result |
//! |-----|------|--------|
//! | [`PROCESS_PROJECT_FILES`] | `{project_id, file_id?, chunk_size?, overlap_size?, do_reset?}` | `{signal, project_id, do_reset, inserted_chunks, processed_files}` |
//! | [`INDEX_DATA_CONTENT`] | `{project_id, do_reset?}` | `{signal, inserted_items_count}` |
//! | [`PUSH_AFTER_PROCESS`] | result of file processing | `{signal, project_id, do_reset, task_results}` |
//! | [`CLEAN_TASK_EXECUTIONS`] | `{retention_secs?}` | `{signal, deleted_count, retention_secs}` |
//!
//! The workflow `process -> push` is a chain: file processing forwards
//! `project_id` and `do_reset` in its result so the push step can index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use walkdir::WalkDir;

use super::{Job, JobContext, JobRegistry};
use crate::app::App;
use crate::chunk::chunks_for_asset;
use crate::error::RagError;
use crate::models::{Asset, Project, ASSET_TYPE_FILE};

pub const INDEX_DATA_CONTENT: &str = "tasks.data_indexing.index_data_content";
pub const PROCESS_PROJECT_FILES: &str = "tasks.file_processing.process_project_files";
pub const PUSH_AFTER_PROCESS: &str = "tasks.process_workflow.push_after_process_task";
pub const CLEAN_TASK_EXECUTIONS: &str = "tasks.maintenance.clean_task_executions";

/// File extensions picked up from a project's file directory.
const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "md"];

/// Outcome codes carried in job results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSignal {
    ProcessingSuccess,
    InsertIntoVectordbSuccess,
    WorkflowSuccess,
    CleanupSuccess,
}

/// All registered jobs, sharing one [`App`].
pub fn registry(app: Arc<App>) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(Arc::new(ProcessProjectFiles { app: app.clone() }));
    registry.register(Arc::new(IndexDataContent { app: app.clone() }));
    registry.register(Arc::new(PushAfterProcess { app: app.clone() }));
    registry.register(Arc::new(CleanTaskExecutions { app }));
    registry
}

fn parse_args<T: serde::de::DeserializeOwned>(task_name: &str, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| RagError::validation(format!("invalid args for {}: {}", task_name, e)).into())
}

/// Accepts `true`/`false` as well as the `0`/`1` integers older callers send.
fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Int(i)) => i != 0,
        None => false,
    })
}

// ============ Indexing ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexArgs {
    pub project_id: i64,
    #[serde(default, deserialize_with = "flag")]
    pub do_reset: bool,
}

struct IndexDataContent {
    app: Arc<App>,
}

#[async_trait]
impl Job for IndexDataContent {
    fn name(&self) -> &'static str {
        INDEX_DATA_CONTENT
    }

    async fn run(&self, ctx: &JobContext, args: Value) -> Result<Value> {
        let args: IndexArgs = parse_args(self.name(), args)?;
        index_project(&self.app, ctx, &args).await
    }
}

async fn index_project(app: &App, ctx: &JobContext, args: &IndexArgs) -> Result<Value> {
    let project = app.projects().get_or_create(args.project_id).await?;
    ctx.update_state("PROGRESS", json!({ "progress": 0 }));

    let report = app
        .indexing()
        .index_project_with_progress(
            &project,
            &app.chunks(),
            app.config.indexing.page_size,
            args.do_reset,
            |inserted, total| {
                let progress = if total > 0 {
                    (inserted as i64 * 100 / total).min(100)
                } else {
                    100
                };
                ctx.update_state(
                    "PROGRESS",
                    json!({ "progress": progress, "inserted": inserted, "total": total }),
                );
            },
        )
        .await?;

    info!(
        project_id = project.project_id,
        inserted = report.inserted_items_count,
        index_created = report.index_created,
        "project indexed"
    );

    Ok(json!({
        "signal": TaskSignal::InsertIntoVectordbSuccess,
        "inserted_items_count": report.inserted_items_count,
    }))
}

// ============ File processing ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessArgs {
    pub project_id: i64,
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub overlap_size: Option<usize>,
    #[serde(default, deserialize_with = "flag")]
    pub do_reset: bool,
}

struct ProcessProjectFiles {
    app: Arc<App>,
}

#[async_trait]
impl Job for ProcessProjectFiles {
    fn name(&self) -> &'static str {
        PROCESS_PROJECT_FILES
    }

    async fn run(&self, ctx: &JobContext, args: Value) -> Result<Value> {
        let args: ProcessArgs = parse_args(self.name(), args)?;
        process_project_files(&self.app, ctx, &args).await
    }
}

/// Directory holding a project's uploaded files.
pub fn project_files_dir(root: &Path, project_id: i64) -> PathBuf {
    root.join(project_id.to_string())
}

/// Register every supported file under the project directory as an asset.
/// Asset names are paths relative to that directory.
async fn register_file_assets(app: &App, project: &Project, dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }

    let mut registered = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to scan {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let supported = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if !supported {
            continue;
        }

        let Ok(relative) = path.strip_prefix(dir) else {
            continue;
        };
        let name = relative.to_string_lossy().replace('\\', "/");
        let size = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);

        app.assets()
            .upsert(
                project.project_id,
                ASSET_TYPE_FILE,
                &name,
                size,
                &json!({ "path": name }),
            )
            .await?;
        registered += 1;
    }
    Ok(registered)
}

async fn process_project_files(app: &App, ctx: &JobContext, args: &ProcessArgs) -> Result<Value> {
    let project = app.projects().get_or_create(args.project_id).await?;
    let dir = project_files_dir(&app.config.files.root, project.project_id);
    ctx.update_state("PROGRESS", json!({ "progress": 0 }));

    let found = register_file_assets(app, &project, &dir).await?;
    info!(project_id = project.project_id, found, dir = %dir.display(), "file assets registered");

    let assets: Vec<Asset> = match &args.file_id {
        Some(name) => {
            let asset = app
                .assets()
                .get_by_name(project.project_id, name)
                .await?
                .ok_or_else(|| {
                    RagError::not_found(format!(
                        "no asset '{}' in project {}",
                        name, project.project_id
                    ))
                })?;
            vec![asset]
        }
        None => app.assets().list(project.project_id, ASSET_TYPE_FILE).await?,
    };

    if assets.is_empty() {
        return Err(RagError::not_found(format!(
            "no files found for project {}",
            project.project_id
        ))
        .into());
    }

    let chunk_size = args.chunk_size.unwrap_or(app.config.files.chunk_size);
    let overlap_size = args.overlap_size.unwrap_or(app.config.files.overlap_size);
    let chunks = app.chunks();

    if args.do_reset {
        app.indexing().reset_collection(&project).await?;
        let deleted = chunks.delete_by_project(project.project_id).await?;
        info!(project_id = project.project_id, deleted, "project chunks reset");
    }

    let mut inserted_chunks = 0;
    let mut processed_files = 0;
    for (i, asset) in assets.iter().enumerate() {
        let path = dir.join(&asset.asset_name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to read file, skipping");
                continue;
            }
        };

        let new_chunks = chunks_for_asset(
            project.project_id,
            asset.asset_id,
            &asset.asset_name,
            &text,
            chunk_size,
            overlap_size,
        );
        if new_chunks.is_empty() {
            warn!(file = %asset.asset_name, "no chunks produced");
        }

        let replaced = chunks.replace_for_asset(asset.asset_id, &new_chunks).await?;
        app.indexing()
            .remove_chunks(&project, &replaced.removed_ids)
            .await?;
        inserted_chunks += replaced.written;
        processed_files += 1;

        ctx.update_state(
            "PROGRESS",
            json!({ "progress": (i + 1) * 100 / assets.len(), "file": asset.asset_name }),
        );
    }

    Ok(json!({
        "signal": TaskSignal::ProcessingSuccess,
        "project_id": project.project_id,
        "do_reset": args.do_reset,
        "inserted_chunks": inserted_chunks,
        "processed_files": processed_files,
    }))
}

// ============ Workflow ============

struct PushAfterProcess {
    app: Arc<App>,
}

#[async_trait]
impl Job for PushAfterProcess {
    fn name(&self) -> &'static str {
        PUSH_AFTER_PROCESS
    }

    /// Receives the file-processing result and indexes the same project.
    async fn run(&self, ctx: &JobContext, args: Value) -> Result<Value> {
        let index_args: IndexArgs = parse_args(self.name(), args.clone())?;
        let indexed = index_project(&self.app, ctx, &index_args).await?;

        Ok(json!({
            "signal": TaskSignal::WorkflowSuccess,
            "project_id": index_args.project_id,
            "do_reset": index_args.do_reset,
            "task_results": {
                "process": args,
                "index": indexed,
            },
        }))
    }
}

// ============ Maintenance ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupArgs {
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

struct CleanTaskExecutions {
    app: Arc<App>,
}

#[async_trait]
impl Job for CleanTaskExecutions {
    fn name(&self) -> &'static str {
        CLEAN_TASK_EXECUTIONS
    }

    async fn run(&self, _ctx: &JobContext, args: Value) -> Result<Value> {
        let args: CleanupArgs = if args.is_null() {
            CleanupArgs::default()
        } else {
            parse_args(self.name(), args)?
        };
        let retention_secs = args
            .retention_secs
            .unwrap_or(self.app.config.jobs.retention_secs);
        let deleted_count = self.app.ledger().cleanup_old_tasks(retention_secs).await?;

        Ok(json!({
            "signal": TaskSignal::CleanupSuccess,
            "deleted_count": deleted_count,
            "retention_secs": retention_secs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_accepts_ints_and_bools() {
        let a: IndexArgs = serde_json::from_value(json!({"project_id": 1, "do_reset": 1})).unwrap();
        let b: IndexArgs = serde_json::from_value(json!({"project_id": 1, "do_reset": false})).unwrap();
        let c: IndexArgs = serde_json::from_value(json!({"project_id": 1})).unwrap();
        assert!(a.do_reset);
        assert!(!b.do_reset);
        assert!(!c.do_reset);
    }

    #[test]
    fn test_process_result_feeds_index_args() {
        let result = json!({
            "signal": TaskSignal::ProcessingSuccess,
            "project_id": 4,
            "do_reset": true,
            "inserted_chunks": 10,
            "processed_files": 2,
        });
        let args: IndexArgs = serde_json::from_value(result).unwrap();
        assert_eq!(args.project_id, 4);
        assert!(args.do_reset);
    }

    #[test]
    fn test_bad_args_are_validation_errors() {
        let err = parse_args::<IndexArgs>("t", json!({"nope": 1})).unwrap_err();
        let signal = crate::error::Signal::from_anyhow(&err);
        assert_eq!(signal.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(
            serde_json::to_value(TaskSignal::InsertIntoVectordbSuccess).unwrap(),
            "insert_into_vectordb_success"
        );
    }
}
