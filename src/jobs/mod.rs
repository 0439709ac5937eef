//! Background job runner.
//!
//! A [`JobRunner`] owns a pool of tokio workers fed by one queue. Each worker
//! takes a [`JobRequest`], runs it to completion (including any chained
//! follow-up jobs), and replies on the request's [`JobHandle`].
//!
//! Every execution goes through the [`IdempotencyLedger`]:
//!
//! ```text
//!   submit ──▶ queue ──▶ worker ──▶ should_execute? ──no──▶ cached / in-flight outcome
//!                                        │yes
//!                                        ▼
//!                          create/reuse record ─▶ STARTED ─▶ Job::run
//!                                                              │
//!                                   ok ─▶ SUCCESS(result)      │ err
//!                                   retryable & budget left ─▶ RETRY ─▶ sleep ─▶ STARTED
//!                                   otherwise ─▶ FAILURE(signal)
//! ```
//!
//! Retries keep the delivery's job id, so a redelivered job finds the same
//! ledger record. Delivery is at-least-once; job bodies must tolerate running
//! twice with the same arguments.

pub mod tasks;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::error::{RagError, Signal};
use crate::ledger::{DecisionReason, IdempotencyLedger, TaskExecutionRecord};
use crate::progress::{JobEvent, JobObserver};

/// Automatic retry for failures whose kind is retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub countdown: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            countdown: Duration::from_secs(config.retry_countdown_secs),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            countdown: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            countdown: Duration::from_secs(60),
        }
    }
}

/// A unit of work addressable by name.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run with JSON `args`, producing a JSON result.
    async fn run(&self, ctx: &JobContext, args: Value) -> Result<Value>;
}

/// Handed to a running job for state reporting.
pub struct JobContext {
    job_id: String,
    task_name: String,
    attempt: u32,
    observer: Arc<dyn JobObserver>,
}

impl JobContext {
    pub fn new(job_id: &str, task_name: &str, attempt: u32, observer: Arc<dyn JobObserver>) -> Self {
        Self {
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            attempt,
            observer,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Publish an intermediate state such as `PROGRESS`.
    pub fn update_state(&self, state: &str, meta: Value) {
        self.observer.report(JobEvent::State {
            job_id: self.job_id.clone(),
            task_name: self.task_name.clone(),
            state: state.to_string(),
            meta,
        });
    }
}

#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: HashMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: Arc<dyn Job>) {
        self.jobs.insert(job.name().to_string(), job);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

/// A job to run, plus any jobs chained after it.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub task_name: String,
    pub args: Value,
    /// Correlation id: redelivering the same id with the same args is
    /// deduplicated by the ledger.
    pub job_id: String,
    then: Vec<String>,
}

impl JobRequest {
    pub fn new(task_name: &str, args: Value) -> Self {
        Self {
            task_name: task_name.to_string(),
            args,
            job_id: Uuid::new_v4().to_string(),
            then: Vec::new(),
        }
    }

    pub fn with_job_id(mut self, job_id: &str) -> Self {
        self.job_id = job_id.to_string();
        self
    }

    /// Run `task_name` after this job succeeds, with this job's result as
    /// its args.
    pub fn then(mut self, task_name: &str) -> Self {
        self.then.push(task_name.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Failure,
    /// Another delivery of the same job is still running.
    InFlight,
}

/// Final result of a submitted job (the last job, for chains).
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub task_name: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Signal>,
    pub attempts: u32,
    /// True when the result came from an earlier successful execution.
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<i64>,
}

impl JobOutcome {
    fn failure(job_id: &str, task_name: &str, signal: Signal, attempts: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            status: JobStatus::Failure,
            result: None,
            error: Some(signal),
            attempts,
            cached: false,
            execution_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Success
    }
}

/// Await to receive the job's [`JobOutcome`].
pub struct JobHandle {
    pub id: String,
    rx: oneshot::Receiver<JobOutcome>,
}

impl Future for JobHandle {
    type Output = Result<JobOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| anyhow!("job runner stopped before the job finished")))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub workers: usize,
    pub time_limit_secs: u64,
    pub retry: RetryPolicy,
}

impl RunnerSettings {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            workers: config.workers,
            time_limit_secs: config.time_limit_secs,
            retry: RetryPolicy::from_config(config),
        }
    }
}

struct Queued {
    request: JobRequest,
    reply: oneshot::Sender<JobOutcome>,
}

struct Executor {
    registry: JobRegistry,
    ledger: IdempotencyLedger,
    settings: RunnerSettings,
    observer: Arc<dyn JobObserver>,
}

pub struct JobRunner {
    sender: Option<mpsc::UnboundedSender<Queued>>,
    workers: Vec<JoinHandle<()>>,
    registry: JobRegistry,
}

impl JobRunner {
    pub fn start(
        registry: JobRegistry,
        ledger: IdempotencyLedger,
        settings: RunnerSettings,
        observer: Arc<dyn JobObserver>,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<Queued>();
        let receiver = Arc::new(Mutex::new(receiver));
        let executor = Arc::new(Executor {
            registry: registry.clone(),
            ledger,
            settings,
            observer,
        });

        let worker_count = settings.workers.max(1);
        let workers = (0..worker_count)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let executor = executor.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut rx = receiver.lock().await;
                            rx.recv().await
                        };
                        let Some(queued) = next else {
                            break;
                        };
                        debug!(worker_id, job_id = %queued.request.job_id, "worker picked job");
                        let outcome = executor.run_chain(queued.request).await;
                        let _ = queued.reply.send(outcome);
                    }
                    debug!(worker_id, "worker stopped");
                })
            })
            .collect();

        info!(workers = worker_count, "job runner started");
        Self {
            sender: Some(sender),
            workers,
            registry,
        }
    }

    pub fn submit(&self, task_name: &str, args: Value) -> Result<JobHandle> {
        self.submit_request(JobRequest::new(task_name, args))
    }

    /// Run `first`, then `second` with `first`'s result as its args.
    pub fn chain(&self, first: JobRequest, second: &str) -> Result<JobHandle> {
        self.submit_request(first.then(second))
    }

    pub fn submit_request(&self, request: JobRequest) -> Result<JobHandle> {
        for name in std::iter::once(&request.task_name).chain(request.then.iter()) {
            if self.registry.get(name).is_none() {
                return Err(RagError::validation(format!("unknown job '{}'", name)).into());
            }
        }

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("job runner is shut down"))?;
        let (reply, rx) = oneshot::channel();
        let id = request.job_id.clone();
        sender
            .send(Queued { request, reply })
            .map_err(|_| anyhow!("job queue closed"))?;

        debug!(job_id = %id, "job queued");
        Ok(JobHandle { id, rx })
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        info!("job runner stopped");
    }
}

impl Executor {
    async fn run_chain(&self, request: JobRequest) -> JobOutcome {
        let mut outcome = self
            .run_idempotent(&request.task_name, request.args, &request.job_id)
            .await;

        for (step, next) in request.then.iter().enumerate() {
            if !outcome.is_success() {
                break;
            }
            let args = outcome.result.clone().unwrap_or(Value::Null);
            let job_id = format!("{}:{}", request.job_id, step + 1);
            outcome = self.run_idempotent(next, args, &job_id).await;
        }
        outcome
    }

    async fn run_idempotent(&self, task_name: &str, args: Value, job_id: &str) -> JobOutcome {
        match self.execute(task_name, &args, job_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let signal = Signal::from_anyhow(&e);
                error!(%job_id, %task_name, error = %signal.message, "job bookkeeping failed");
                self.finished(job_id, task_name, "FAILURE");
                JobOutcome::failure(job_id, task_name, signal, 0)
            }
        }
    }

    async fn execute(&self, task_name: &str, args: &Value, job_id: &str) -> Result<JobOutcome> {
        let job = self
            .registry
            .get(task_name)
            .ok_or_else(|| RagError::validation(format!("unknown job '{}'", task_name)))?;

        let decision = self
            .ledger
            .should_execute(task_name, args, job_id, self.settings.time_limit_secs)
            .await?;

        if !decision.execute {
            return Ok(self.skipped(job_id, task_name, decision.reason, decision.record));
        }

        let record = match decision.record {
            Some(record) => record,
            None => self.ledger.create_record(task_name, args, job_id).await?,
        };
        let execution_id = record.execution_id;

        let policy = self.settings.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self
                .attempt(job.as_ref(), execution_id, task_name, args, job_id, attempt)
                .await
            {
                Ok(result) => {
                    self.finished(job_id, task_name, "SUCCESS");
                    return Ok(JobOutcome {
                        job_id: job_id.to_string(),
                        task_name: task_name.to_string(),
                        status: JobStatus::Success,
                        result: Some(result),
                        error: None,
                        attempts: attempt,
                        cached: false,
                        execution_id: Some(execution_id),
                    });
                }
                Err(e) => e,
            };

            let signal = Signal::from_anyhow(&error);
            let meta = json!({ "error": signal });

            if signal.kind.is_retryable() && attempt <= policy.max_retries {
                if let Err(e) = self.ledger.mark_retry(execution_id, &meta).await {
                    warn!(%job_id, execution_id, error = %e, "failed to record retry");
                }
                self.observer.report(JobEvent::Retrying {
                    job_id: job_id.to_string(),
                    task_name: task_name.to_string(),
                    attempt,
                    countdown_secs: policy.countdown.as_secs(),
                    error: signal.message.clone(),
                });
                tokio::time::sleep(policy.countdown).await;
                continue;
            }

            if let Err(e) = self.ledger.mark_failure(execution_id, &meta).await {
                error!(%job_id, execution_id, error = %e, "failed to record job failure");
            }
            self.finished(job_id, task_name, "FAILURE");
            let mut outcome = JobOutcome::failure(job_id, task_name, signal, attempt);
            outcome.execution_id = Some(execution_id);
            return Ok(outcome);
        }
    }

    /// One attempt: stamp STARTED, run the body, stamp SUCCESS. Ledger
    /// errors fail the attempt the same way a job error does.
    async fn attempt(
        &self,
        job: &dyn Job,
        execution_id: i64,
        task_name: &str,
        args: &Value,
        job_id: &str,
        attempt: u32,
    ) -> Result<Value> {
        self.ledger.mark_started(execution_id).await?;
        self.observer.report(JobEvent::Started {
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            attempt,
        });

        let ctx = JobContext::new(job_id, task_name, attempt, self.observer.clone());
        let result = job.run(&ctx, args.clone()).await?;
        self.ledger.mark_success(execution_id, &result).await?;
        Ok(result)
    }

    fn skipped(
        &self,
        job_id: &str,
        task_name: &str,
        reason: DecisionReason,
        record: Option<TaskExecutionRecord>,
    ) -> JobOutcome {
        let reason_str = serde_json::to_value(reason)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        self.observer.report(JobEvent::Skipped {
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            reason: reason_str,
        });

        let completed = reason == DecisionReason::Completed;
        JobOutcome {
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            status: if completed {
                JobStatus::Success
            } else {
                JobStatus::InFlight
            },
            result: record.as_ref().and_then(|r| r.result.clone()),
            error: None,
            attempts: 0,
            cached: completed,
            execution_id: record.map(|r| r.execution_id),
        }
    }

    fn finished(&self, job_id: &str, task_name: &str, status: &str) {
        self.observer.report(JobEvent::Finished {
            job_id: job_id.to_string(),
            task_name: task_name.to_string(),
            status: status.to_string(),
        });
    }
}
