//! End-to-end tests for indexing, retrieval, answering, and the job layer.
//!
//! Providers are replaced by deterministic in-process fakes so the full
//! pipeline (files → chunks → vectors → answers) runs without network access.

use std::collections::HashMap;
use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use ragdock::app::App;
use ragdock::config::parse_config;
use ragdock::embedding::{EmbedPurpose, Embedder};
use ragdock::error::{RagError, Result};
use ragdock::generation::{ChatMessage, Generator};
use ragdock::jobs::{tasks, JobRequest, JobRunner, JobStatus, RetryPolicy, RunnerSettings};
use ragdock::ledger::{args_hash, IdempotencyLedger, TaskStatus};
use ragdock::models::{Chunk, Project};
use ragdock::progress::TracingObserver;
use ragdock::retrieval::APOLOGY;
use ragdock::store::{DistanceMethod, EmbeddedStore, VectorStore};
use ragdock::templates::TemplateParser;
use ragdock::{db, migrate};

// ─── Fakes ──────────────────────────────────────────────────────────

const DIMS: usize = 16;

/// Bag-of-words embedder: each lowercase word is hashed into one of
/// [`DIMS`] buckets. Identical texts get identical vectors.
struct HashEmbedder {
    calls: AtomicUsize,
}

impl HashEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; DIMS];
        for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
            v[(bucket % DIMS as u64) as usize] += 1.0;
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-test"
    }
    fn dims(&self) -> usize {
        DIMS
    }
    async fn embed(&self, texts: &[String], _purpose: EmbedPurpose) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

enum Reply {
    Text(&'static str),
    Blank,
    Fail,
}

struct FakeGenerator {
    reply: Reply,
}

#[async_trait]
impl Generator for FakeGenerator {
    fn model_name(&self) -> &str {
        "fake"
    }
    fn max_input_chars(&self) -> usize {
        1000
    }
    async fn generate(&self, _prompt: &str, _history: &[ChatMessage]) -> Result<String> {
        match self.reply {
            Reply::Text(t) => Ok(t.to_string()),
            Reply::Blank => Ok("   ".to_string()),
            Reply::Fail => Err(RagError::provider("model overloaded")),
        }
    }
}

// ─── Setup ──────────────────────────────────────────────────────────

const DEPLOY_DOC: &str = "Deployments run through the release pipeline every Tuesday morning. \
Each release is tagged in git before the pipeline starts building artifacts. \
Rollbacks are performed by redeploying the previous tagged release.";

const CACHE_DOC: &str = "The cache layer stores rendered pages for ten minutes at most. \
Cache invalidation happens whenever an editor publishes a new revision. \
Stale entries are evicted by a background sweeper every hour.";

struct Harness {
    _tmp: TempDir,
    app: Arc<App>,
    embedder: Arc<HashEmbedder>,
}

async fn harness(reply: Reply) -> Harness {
    let tmp = TempDir::new().unwrap();
    let files = tmp.path().join("files");
    fs::create_dir_all(files.join("1")).unwrap();
    fs::write(files.join("1").join("deploy.md"), DEPLOY_DOC).unwrap();
    fs::write(files.join("1").join("cache.txt"), CACHE_DOC).unwrap();
    fs::write(files.join("1").join("image.png"), [0u8, 1, 2]).unwrap();

    let config = parse_config(&format!(
        r#"
[db]
path = "{root}/data/ragdock.sqlite"

[vector_db]
path = "{root}/data/vectors"

[files]
root = "{root}/files"
chunk_size = 120
overlap_size = 10

[indexing]
page_size = 2

[jobs]
workers = 2
max_retries = 0
"#,
        root = tmp.path().display()
    ))
    .unwrap();

    let pool = db::connect_in_memory().await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();

    let embedder = Arc::new(HashEmbedder::new());
    let app = App::from_parts(
        config,
        pool,
        Arc::new(EmbeddedStore::open(
            &tmp.path().join("data").join("vectors"),
            DistanceMethod::Cosine,
        )),
        embedder.clone(),
        Arc::new(FakeGenerator { reply }),
        Arc::new(TemplateParser::builtin("en")),
    );
    app.store.connect().await.unwrap();

    Harness {
        _tmp: tmp,
        app: Arc::new(app),
        embedder,
    }
}

fn runner(app: &Arc<App>) -> JobRunner {
    let mut settings = RunnerSettings::from_config(&app.config.jobs);
    settings.retry = RetryPolicy::none();
    JobRunner::start(
        tasks::registry(app.clone()),
        app.ledger(),
        settings,
        Arc::new(TracingObserver),
    )
}

async fn run_workflow(app: &Arc<App>, project_id: i64) {
    run_workflow_with_reset(app, project_id, true).await;
}

async fn run_workflow_with_reset(app: &Arc<App>, project_id: i64, do_reset: bool) {
    let runner = runner(app);
    let outcome = runner
        .chain(
            JobRequest::new(
                tasks::PROCESS_PROJECT_FILES,
                json!({ "project_id": project_id, "do_reset": do_reset }),
            ),
            tasks::PUSH_AFTER_PROCESS,
        )
        .unwrap()
        .await
        .unwrap();
    runner.shutdown().await;
    assert_eq!(outcome.status, JobStatus::Success, "{:?}", outcome);
}

fn orthonormal() -> Vec<Vec<f32>> {
    vec![
        vec![1.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![0.0, 0.0, 1.0],
    ]
}

fn texts(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ─── Store contract ─────────────────────────────────────────────────

#[tokio::test]
async fn test_insert_three_reports_three_records() {
    let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
    assert!(store.create_collection("collection_3_1", 3, false).await.unwrap());

    let inserted = store
        .insert_many(
            "collection_3_1",
            &texts(&["a", "b", "c"]),
            &orthonormal(),
            None,
            &[1, 2, 3],
            10,
        )
        .await
        .unwrap();
    assert_eq!(inserted, 3);

    let info = store.get_collection_info("collection_3_1").await.unwrap().unwrap();
    assert_eq!(info.record_count, 3);
    assert_eq!(info.dimension, Some(3));
}

#[tokio::test]
async fn test_search_is_bounded_and_sorted() {
    let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
    store.create_collection("collection_3_1", 3, false).await.unwrap();
    store
        .insert_many(
            "collection_3_1",
            &texts(&["a", "b", "c"]),
            &orthonormal(),
            None,
            &[1, 2, 3],
            2,
        )
        .await
        .unwrap();

    let results = store
        .search_by_vector("collection_3_1", &[0.9, 0.3, 0.1], 10)
        .await
        .unwrap();
    assert!(results.len() <= 3);
    assert_eq!(results[0].text, "a");
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score, "{:?}", results);
    }
}

#[tokio::test]
async fn test_create_collection_twice_is_not_new() {
    let store = EmbeddedStore::in_memory(DistanceMethod::Dot);
    assert!(store.create_collection("c", 4, false).await.unwrap());
    assert!(!store.create_collection("c", 4, false).await.unwrap());
    assert!(store.create_collection("c", 4, true).await.unwrap());
}

#[tokio::test]
async fn test_reinserting_same_ids_replaces_records() {
    let store = EmbeddedStore::in_memory(DistanceMethod::Cosine);
    store.create_collection("c", 3, false).await.unwrap();
    for _ in 0..2 {
        store
            .insert_many("c", &texts(&["a", "b", "c"]), &orthonormal(), None, &[1, 2, 3], 3)
            .await
            .unwrap();
    }
    let info = store.get_collection_info("c").await.unwrap().unwrap();
    assert_eq!(info.record_count, 3);
}

// ─── Indexing and retrieval ─────────────────────────────────────────

#[tokio::test]
async fn test_answer_without_indexed_chunks_is_none() {
    let h = harness(Reply::Text("unused")).await;
    let project = h.app.projects().get_or_create(9).await.unwrap();

    // No collection at all.
    let answer = h.app.answerer().answer_question(&project, "anything?", 5).await.unwrap();
    assert!(answer.is_none());

    // Collection exists but holds nothing.
    let report = h
        .app
        .indexing()
        .index_project(&project, &h.app.chunks(), 10, false)
        .await
        .unwrap();
    assert_eq!(report.inserted_items_count, 0);
    let answer = h.app.answerer().answer_question(&project, "anything?", 5).await.unwrap();
    assert!(answer.is_none());
}

#[tokio::test]
async fn test_collection_info_before_and_after_indexing() {
    let h = harness(Reply::Text("ok")).await;
    let project = h.app.projects().get_or_create(1).await.unwrap();

    let before = h.app.indexing().collection_info(&project).await.unwrap();
    assert!(!before.exists);
    assert_eq!(before.record_count, 0);
    assert_eq!(before.collection_name, format!("collection_{}_1", DIMS));

    run_workflow(&h.app, 1).await;

    let after = h.app.indexing().collection_info(&project).await.unwrap();
    assert!(after.exists);
    assert_eq!(after.record_count as i64, h.app.chunks().count(1).await.unwrap());
}

#[tokio::test]
async fn test_round_trip_recall() {
    let h = harness(Reply::Text("ok")).await;
    run_workflow(&h.app, 1).await;
    let project = h.app.projects().get_or_create(1).await.unwrap();

    let chunks: Vec<Chunk> = h.app.chunks().page(1, 1, 100).await.unwrap();
    assert!(chunks.len() > 2, "expected several chunks, got {}", chunks.len());

    for chunk in &chunks {
        let results = h
            .app
            .answerer()
            .search_collection(&project, &chunk.chunk_text, 3)
            .await
            .unwrap();
        assert!(
            results.iter().any(|r| r.chunk_id == chunk.chunk_id),
            "chunk {} not recalled",
            chunk.chunk_id
        );
        assert!((results[0].score - 1.0).abs() < 1e-4);
    }
}

#[tokio::test]
async fn test_paginated_indexing_keeps_every_page() {
    let h = harness(Reply::Text("ok")).await;
    let project = h.app.projects().get_or_create(1).await.unwrap();

    let runner = runner(&h.app);
    runner
        .submit(tasks::PROCESS_PROJECT_FILES, json!({ "project_id": 1 }))
        .unwrap()
        .await
        .unwrap();
    runner.shutdown().await;

    let total = h.app.chunks().count(1).await.unwrap();
    let report = h
        .app
        .indexing()
        .index_project(&project, &h.app.chunks(), 2, true)
        .await
        .unwrap();

    assert_eq!(report.inserted_items_count as i64, total);
    assert_eq!(report.pages as i64, (total + 1) / 2);
    let status = h.app.indexing().collection_info(&project).await.unwrap();
    assert_eq!(status.record_count as i64, total);
}

#[tokio::test]
async fn test_blank_query_is_rejected() {
    let h = harness(Reply::Text("ok")).await;
    let project = h.app.projects().get_or_create(1).await.unwrap();
    let err = h
        .app
        .answerer()
        .search_collection(&project, " \n\t", 5)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Validation(_)));
}

#[tokio::test]
async fn test_answer_uses_generator_output() {
    let h = harness(Reply::Text("Deploys happen on Tuesdays.")).await;
    run_workflow(&h.app, 1).await;
    let project = h.app.projects().get_or_create(1).await.unwrap();

    let answer = h
        .app
        .answerer()
        .answer_question(&project, "When do deployments run?", 3)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(answer.answer, "Deploys happen on Tuesdays.");
    assert!(answer.full_prompt.starts_with("## Document No: 1\n### Content: "));
    assert!(answer.full_prompt.contains("## Question:\nWhen do deployments run?"));
    assert_eq!(answer.chat_history.len(), 1);
    assert_eq!(answer.chat_history[0].role, "system");
}

#[tokio::test]
async fn test_generation_failure_falls_back_to_summary() {
    for reply in [Reply::Fail, Reply::Blank] {
        let h = harness(reply).await;
        run_workflow(&h.app, 1).await;
        let project = h.app.projects().get_or_create(1).await.unwrap();

        let answer = h
            .app
            .answerer()
            .answer_question(&project, "How are rollbacks done?", 5)
            .await
            .unwrap()
            .unwrap();

        assert!(!answer.answer.trim().is_empty());
        assert_ne!(answer.answer, APOLOGY);
        assert!(answer.full_prompt.contains("How are rollbacks done?"));
    }
}

// ─── Jobs and ledger ────────────────────────────────────────────────

#[tokio::test]
async fn test_workflow_result_shape() {
    let h = harness(Reply::Text("ok")).await;
    let runner = runner(&h.app);
    let outcome = runner
        .chain(
            JobRequest::new(tasks::PROCESS_PROJECT_FILES, json!({ "project_id": 1 })),
            tasks::PUSH_AFTER_PROCESS,
        )
        .unwrap()
        .await
        .unwrap();
    runner.shutdown().await;

    let result = outcome.result.unwrap();
    assert_eq!(result["signal"], "workflow_success");
    assert_eq!(result["project_id"], 1);
    assert_eq!(result["task_results"]["process"]["processed_files"], 2);
    assert_eq!(
        result["task_results"]["index"]["inserted_items_count"],
        result["task_results"]["process"]["inserted_chunks"]
    );
}

#[tokio::test]
async fn test_process_single_file_and_missing_file() {
    let h = harness(Reply::Text("ok")).await;
    let runner = runner(&h.app);

    let one = runner
        .submit(
            tasks::PROCESS_PROJECT_FILES,
            json!({ "project_id": 1, "file_id": "deploy.md" }),
        )
        .unwrap()
        .await
        .unwrap();
    assert_eq!(one.result.unwrap()["processed_files"], 1);

    let missing = runner
        .submit(
            tasks::PROCESS_PROJECT_FILES,
            json!({ "project_id": 1, "file_id": "nope.md" }),
        )
        .unwrap()
        .await
        .unwrap();
    assert_eq!(missing.status, JobStatus::Failure);
    assert_eq!(missing.error.unwrap().kind.as_str(), "not_found");

    let empty = runner
        .submit(tasks::PROCESS_PROJECT_FILES, json!({ "project_id": 77 }))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(empty.status, JobStatus::Failure);
    runner.shutdown().await;
}

#[tokio::test]
async fn test_reprocessing_does_not_duplicate_chunks() {
    let h = harness(Reply::Text("ok")).await;
    let runner = runner(&h.app);
    for _ in 0..2 {
        runner
            .submit(tasks::PROCESS_PROJECT_FILES, json!({ "project_id": 1 }))
            .unwrap()
            .await
            .unwrap();
    }
    runner.shutdown().await;

    let count = assert_chunk_orders_unique(&h).await;
    assert_eq!(count, h.app.chunks().count(1).await.unwrap());
    assert!(count > 0);
    let assets = h.app.assets().list(1, "file").await.unwrap();
    assert_eq!(assets.len(), 2);
}

#[tokio::test]
async fn test_workflow_twice_without_reset_keeps_store_in_step() {
    let h = harness(Reply::Text("ok")).await;
    let project = h.app.projects().get_or_create(1).await.unwrap();

    run_workflow_with_reset(&h.app, 1, false).await;
    let first_ids: Vec<i64> = h
        .app
        .chunks()
        .page(1, 1, 1000)
        .await
        .unwrap()
        .iter()
        .map(|c| c.chunk_id)
        .collect();

    run_workflow_with_reset(&h.app, 1, false).await;
    let count = assert_chunk_orders_unique(&h).await;
    let status = h.app.indexing().collection_info(&project).await.unwrap();
    assert_eq!(status.record_count as i64, count);
    let second_ids: Vec<i64> = h
        .app
        .chunks()
        .page(1, 1, 1000)
        .await
        .unwrap()
        .iter()
        .map(|c| c.chunk_id)
        .collect();
    assert_eq!(first_ids, second_ids);

    // Shrinking a file drops its trailing chunks from both stores.
    fs::write(
        h._tmp.path().join("files").join("1").join("deploy.md"),
        "Deployments run on Tuesdays.",
    )
    .unwrap();
    run_workflow_with_reset(&h.app, 1, false).await;

    let chunks = h.app.chunks().page(1, 1, 1000).await.unwrap();
    assert!((chunks.len() as i64) < count);
    let status = h.app.indexing().collection_info(&project).await.unwrap();
    assert_eq!(status.record_count as i64, h.app.chunks().count(1).await.unwrap());

    let results = h
        .app
        .answerer()
        .search_collection(&project, "Deployments run on Tuesdays.", 100)
        .await
        .unwrap();
    assert_eq!(results.len(), chunks.len());
    for r in &results {
        assert!(
            chunks.iter().any(|c| c.chunk_id == r.chunk_id && c.chunk_text == r.text),
            "stale vector for chunk {}",
            r.chunk_id
        );
    }
}

async fn assert_chunk_orders_unique(h: &Harness) -> i64 {
    let chunks = h.app.chunks().page(1, 1, 1000).await.unwrap();
    let mut per_asset: HashMap<i64, Vec<i64>> = HashMap::new();
    for c in &chunks {
        per_asset.entry(c.chunk_asset_id).or_default().push(c.chunk_order);
    }
    for orders in per_asset.values() {
        let mut sorted = orders.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), orders.len(), "duplicate chunk orders: {:?}", orders);
        assert_eq!(sorted[0], 1);
    }
    chunks.len() as i64
}

#[tokio::test]
async fn test_redelivered_index_job_is_not_rerun() {
    let h = harness(Reply::Text("ok")).await;
    run_workflow(&h.app, 1).await;
    let calls_before = h.embedder.calls.load(Ordering::SeqCst);

    let runner = runner(&h.app);
    let request =
        JobRequest::new(tasks::INDEX_DATA_CONTENT, json!({ "project_id": 1 })).with_job_id("job-42");

    let first = runner.submit_request(request.clone()).unwrap().await.unwrap();
    let calls_after_first = h.embedder.calls.load(Ordering::SeqCst);
    let second = runner.submit_request(request).unwrap().await.unwrap();
    runner.shutdown().await;

    assert!(first.is_success() && !first.cached);
    assert!(second.is_success() && second.cached);
    assert_eq!(second.result, first.result);
    assert!(calls_after_first > calls_before);
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), calls_after_first);

    // Re-indexing without reset upserts by chunk id.
    let project = h.app.projects().get_or_create(1).await.unwrap();
    let status = h.app.indexing().collection_info(&project).await.unwrap();
    assert_eq!(status.record_count as i64, h.app.chunks().count(1).await.unwrap());
}

#[tokio::test]
async fn test_ledger_records_success_with_result() {
    let h = harness(Reply::Text("ok")).await;
    let runner = runner(&h.app);
    let args = json!({ "project_id": 1, "do_reset": false });
    let outcome = runner
        .submit_request(JobRequest::new(tasks::INDEX_DATA_CONTENT, args.clone()).with_job_id("j"))
        .unwrap()
        .await
        .unwrap();
    runner.shutdown().await;

    let ledger: IdempotencyLedger = h.app.ledger();
    let record = ledger
        .find(tasks::INDEX_DATA_CONTENT, &args, "j")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Success);
    assert_eq!(record.task_args_hash, args_hash(tasks::INDEX_DATA_CONTENT, &args));
    assert_eq!(Some(record.execution_id), outcome.execution_id);
    assert_eq!(record.result.unwrap()["signal"], "insert_into_vectordb_success");
}

#[tokio::test]
async fn test_args_hash_is_key_order_independent() {
    assert_eq!(
        args_hash("t", &json!({"a": 1, "b": 2})),
        args_hash("t", &json!({"b": 2, "a": 1}))
    );
}

#[tokio::test]
async fn test_cleanup_zero_retention_clears_ledger() {
    let h = harness(Reply::Text("ok")).await;
    run_workflow(&h.app, 1).await;

    let runner = runner(&h.app);
    let outcome = runner
        .submit(tasks::CLEAN_TASK_EXECUTIONS, json!({ "retention_secs": 0 }))
        .unwrap()
        .await
        .unwrap();
    runner.shutdown().await;

    // Two workflow records plus the running cleanup job's own record.
    let result = outcome.result.unwrap();
    assert_eq!(result["deleted_count"], 3);
    let project = Project {
        project_id: 1,
        project_uuid: String::new(),
        created_at: 0,
        updated_at: None,
    };
    // The vector data is untouched by ledger cleanup.
    let status = h.app.indexing().collection_info(&project).await.unwrap();
    assert!(status.exists);
}
