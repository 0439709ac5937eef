//! # ragdock CLI
//!
//! Drives the indexing and answering pipeline from the command line. Jobs
//! (`process`, `index`, `workflow`, `cleanup`) go through the same idempotent
//! job runner used by long-running deployments; the read commands call the
//! orchestrators directly.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ragdock init` | Create the SQLite database and run schema migrations |
//! | `ragdock process <project>` | Chunk the project's files into the database |
//! | `ragdock index <project>` | Embed all chunks into the vector store |
//! | `ragdock workflow <project>` | `process` then `index`, as one chain |
//! | `ragdock info <project>` | Collection metadata |
//! | `ragdock search <project> "<text>"` | Nearest chunks with scores |
//! | `ragdock answer <project> "<question>"` | RAG answer with prompt and history |
//! | `ragdock reset <project>` | Drop the project's collection |
//! | `ragdock cleanup` | Delete old job ledger records |
//!
//! Results are printed to stdout as JSON. Logs and job progress go to stderr
//! (`RAGDOCK_LOG` / `RUST_LOG` control the log filter). On failure a
//! `{"signal": {"kind", "message"}}` object is printed and the exit code is 1.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use ragdock::app::App;
use ragdock::config;
use ragdock::error::Signal;
use ragdock::jobs::{tasks, JobOutcome, JobRequest, JobRunner, RunnerSettings};
use ragdock::progress::ProgressMode;
use ragdock::{db, migrate};

#[derive(Parser)]
#[command(
    name = "ragdock",
    about = "Index documents into a vector store and answer questions over them",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ragdock.toml")]
    config: PathBuf,

    /// Where job progress events go.
    #[arg(long, global = true, value_enum, default_value = "log")]
    progress: ProgressMode,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Split a project's files into chunks.
    ///
    /// Files are read from `<files.root>/<project>/`; `.txt` and `.md` files
    /// are registered as assets and chunked.
    Process {
        project_id: i64,

        #[command(flatten)]
        opts: ProcessOpts,
    },

    /// Embed every chunk of a project into its collection.
    Index {
        project_id: i64,

        /// Drop and recreate the collection first.
        #[arg(long)]
        reset: bool,

        /// Correlation id; resubmitting the same id is deduplicated.
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Process files, then index the resulting chunks.
    Workflow {
        project_id: i64,

        #[command(flatten)]
        opts: ProcessOpts,
    },

    /// Show collection metadata for a project.
    Info { project_id: i64 },

    /// Search a project's collection.
    Search {
        project_id: i64,
        text: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Answer a question from a project's documents.
    Answer {
        project_id: i64,
        text: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Drop a project's collection.
    Reset { project_id: i64 },

    /// Delete job ledger records older than the retention window.
    Cleanup {
        /// Defaults to `jobs.retention_secs`.
        #[arg(long)]
        retention_secs: Option<u64>,
    },
}

#[derive(clap::Args)]
struct ProcessOpts {
    /// Only process this file (name relative to the project directory).
    #[arg(long)]
    file: Option<String>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    overlap: Option<usize>,

    /// Delete the project's chunks and collection first.
    #[arg(long)]
    reset: bool,

    /// Correlation id; resubmitting the same id is deduplicated.
    #[arg(long)]
    job_id: Option<String>,
}

impl ProcessOpts {
    fn args(&self, project_id: i64) -> Value {
        json!({
            "project_id": project_id,
            "file_id": self.file,
            "chunk_size": self.chunk_size,
            "overlap_size": self.overlap,
            "do_reset": self.reset,
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("RAGDOCK_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let signal = Signal::from_anyhow(&e);
            tracing::error!(kind = signal.kind.as_str(), "{}", signal.message);
            print_json(&json!({ "signal": signal }));
            ExitCode::FAILURE
        }
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(e) => tracing::error!(error = %e, "failed to encode output"),
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = config::load_config(&cli.config)?;

    if let Commands::Init = cli.command {
        let pool = db::connect(&config).await?;
        migrate::run_migrations(&pool).await?;
        pool.close().await;
        print_json(&json!({ "initialized": true, "db": config.db.path }));
        return Ok(ExitCode::SUCCESS);
    }

    let app = Arc::new(App::open(config).await?);
    let code = dispatch(&app, cli.command, cli.progress).await;
    app.close().await;
    code
}

async fn dispatch(app: &Arc<App>, command: Commands, progress: ProgressMode) -> Result<ExitCode> {
    match command {
        Commands::Init => {
            migrate::run_migrations(&app.pool).await?;
            print_json(&json!({ "initialized": true, "db": app.config.db.path }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Process { project_id, opts } => {
            let request = with_job_id(
                JobRequest::new(tasks::PROCESS_PROJECT_FILES, opts.args(project_id)),
                opts.job_id.as_deref(),
            );
            run_job(app, progress, request, None).await
        }

        Commands::Index {
            project_id,
            reset,
            job_id,
        } => {
            let request = with_job_id(
                JobRequest::new(
                    tasks::INDEX_DATA_CONTENT,
                    json!({ "project_id": project_id, "do_reset": reset }),
                ),
                job_id.as_deref(),
            );
            run_job(app, progress, request, None).await
        }

        Commands::Workflow { project_id, opts } => {
            let request = with_job_id(
                JobRequest::new(tasks::PROCESS_PROJECT_FILES, opts.args(project_id)),
                opts.job_id.as_deref(),
            );
            run_job(app, progress, request, Some(tasks::PUSH_AFTER_PROCESS)).await
        }

        Commands::Cleanup { retention_secs } => {
            let request = JobRequest::new(
                tasks::CLEAN_TASK_EXECUTIONS,
                json!({ "retention_secs": retention_secs }),
            );
            run_job(app, progress, request, None).await
        }

        Commands::Info { project_id } => {
            let project = app.projects().get_or_create(project_id).await?;
            let status = app.indexing().collection_info(&project).await?;
            print_json(&status);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Search {
            project_id,
            text,
            limit,
        } => {
            let project = app.projects().get_or_create(project_id).await?;
            let results = app
                .answerer()
                .search_collection(&project, &text, limit)
                .await?;
            print_json(&json!({ "results": results }));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Answer {
            project_id,
            text,
            limit,
        } => {
            let project = app.projects().get_or_create(project_id).await?;
            match app.answerer().answer_question(&project, &text, limit).await? {
                Some(answer) => print_json(&answer),
                None => print_json(&json!({
                    "answer": null,
                    "full_prompt": null,
                    "chat_history": null,
                })),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Reset { project_id } => {
            let project = app.projects().get_or_create(project_id).await?;
            let indexing = app.indexing();
            indexing.reset_collection(&project).await?;
            print_json(&json!({
                "collection_name": indexing.collection_name(&project),
                "reset": true,
            }));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn with_job_id(request: JobRequest, job_id: Option<&str>) -> JobRequest {
    match job_id {
        Some(id) => request.with_job_id(id),
        None => request,
    }
}

async fn run_job(
    app: &Arc<App>,
    progress: ProgressMode,
    request: JobRequest,
    then: Option<&str>,
) -> Result<ExitCode> {
    let runner = JobRunner::start(
        tasks::registry(app.clone()),
        app.ledger(),
        RunnerSettings::from_config(&app.config.jobs),
        Arc::from(progress.observer()),
    );

    let handle = match then {
        Some(next) => runner.chain(request, next)?,
        None => runner.submit_request(request)?,
    };
    let outcome: JobOutcome = handle.await?;
    runner.shutdown().await;

    print_json(&outcome);
    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
