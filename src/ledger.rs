//! Idempotency ledger for job executions.
//!
//! Every job run is recorded in `task_executions`, keyed by
//! `(task_name, task_args_hash, correlation_id)`. Before running a job the
//! runner asks [`IdempotencyLedger::should_execute`]:
//!
//! | Existing record | Decision |
//! |-----------------|----------|
//! | none | execute |
//! | `SUCCESS` | skip, return the cached record |
//! | `PENDING` / `STARTED` / `RETRY`, younger than limit + 60s | skip, in flight |
//! | `PENDING` / `STARTED` / `RETRY`, at least limit + 60s old | execute, stuck |
//! | `FAILURE` | execute again |
//!
//! The check is advisory: two deliveries of a brand-new fingerprint that race
//! past the first lookup both run. Once a record exists, duplicates are
//! suppressed.
//!
//! State machine: `PENDING → STARTED → SUCCESS | FAILURE | RETRY`, and
//! `RETRY → STARTED`. Terminal states stamp `completed_at`.

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::{RagError, Result};

/// Grace period added to a job's time limit before it counts as stuck.
pub const STUCK_GRACE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Retry,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "STARTED" => Ok(TaskStatus::Started),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            "RETRY" => Ok(TaskStatus::Retry),
            other => Err(RagError::persistence(format!("unknown task status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskExecutionRecord {
    pub execution_id: i64,
    pub task_name: String,
    pub task_args_hash: String,
    pub task_args: Value,
    pub correlation_id: String,
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    NoRecord,
    Completed,
    InFlight,
    Stuck,
    PreviouslyFailed,
}

/// Outcome of [`IdempotencyLedger::should_execute`].
#[derive(Debug, Clone)]
pub struct Decision {
    pub execute: bool,
    pub reason: DecisionReason,
    pub record: Option<TaskExecutionRecord>,
}

/// Fingerprint of a job invocation: SHA-256 over the key-sorted JSON of
/// `args` with `task_name` merged in. Non-object args are nested under
/// `"args"`.
pub fn args_hash(task_name: &str, args: &Value) -> String {
    let mut combined = match args {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("args".to_string(), other.clone());
            map
        }
    };
    combined.insert("task_name".to_string(), Value::String(task_name.to_string()));

    let mut canonical = String::new();
    write_canonical(&Value::Object(combined), &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    pool: SqlitePool,
}

impl IdempotencyLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find(
        &self,
        task_name: &str,
        args: &Value,
        correlation_id: &str,
    ) -> Result<Option<TaskExecutionRecord>> {
        let hash = args_hash(task_name, args);
        let row = sqlx::query(
            "SELECT * FROM task_executions \
             WHERE task_name = ? AND task_args_hash = ? AND correlation_id = ? \
             ORDER BY execution_id DESC LIMIT 1",
        )
        .bind(task_name)
        .bind(&hash)
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    pub async fn get(&self, execution_id: i64) -> Result<Option<TaskExecutionRecord>> {
        let row = sqlx::query("SELECT * FROM task_executions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    pub async fn should_execute(
        &self,
        task_name: &str,
        args: &Value,
        correlation_id: &str,
        time_limit_secs: u64,
    ) -> Result<Decision> {
        let existing = self.find(task_name, args, correlation_id).await?;
        Ok(decide(existing, time_limit_secs, Utc::now().timestamp()))
    }

    pub async fn create_record(
        &self,
        task_name: &str,
        args: &Value,
        correlation_id: &str,
    ) -> Result<TaskExecutionRecord> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "INSERT INTO task_executions \
             (task_name, task_args_hash, task_args, correlation_id, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(task_name)
        .bind(args_hash(task_name, args))
        .bind(serde_json::to_string(args)?)
        .bind(correlation_id)
        .bind(TaskStatus::Pending.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(execution_id = id, task_name, "task record created");
        self.get(id)
            .await?
            .ok_or_else(|| RagError::persistence(format!("task record {} vanished", id)))
    }

    /// Move a record to `status`. Returns `None` when the id is unknown.
    pub async fn update_status(
        &self,
        execution_id: i64,
        status: TaskStatus,
        result: Option<&Value>,
    ) -> Result<Option<TaskExecutionRecord>> {
        let now = Utc::now().timestamp();
        let result_json = result.map(serde_json::to_string).transpose()?;
        let restarting = status == TaskStatus::Started;
        let started_at = restarting.then_some(now);
        let completed_at = status.is_terminal().then_some(now);

        // STARTED clears the previous attempt's result and completion stamp.
        let updated = sqlx::query(
            "UPDATE task_executions SET \
                status = ?, \
                result = CASE WHEN ? THEN NULL ELSE COALESCE(?, result) END, \
                started_at = COALESCE(?, started_at), \
                completed_at = CASE WHEN ? THEN NULL ELSE COALESCE(?, completed_at) END, \
                updated_at = ? \
             WHERE execution_id = ?",
        )
        .bind(status.as_str())
        .bind(restarting)
        .bind(result_json)
        .bind(started_at)
        .bind(restarting)
        .bind(completed_at)
        .bind(now)
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        debug!(execution_id, status = %status, "task status updated");
        self.get(execution_id).await
    }

    pub async fn mark_started(&self, execution_id: i64) -> Result<Option<TaskExecutionRecord>> {
        self.update_status(execution_id, TaskStatus::Started, None).await
    }

    pub async fn mark_success(
        &self,
        execution_id: i64,
        result: &Value,
    ) -> Result<Option<TaskExecutionRecord>> {
        self.update_status(execution_id, TaskStatus::Success, Some(result))
            .await
    }

    pub async fn mark_failure(
        &self,
        execution_id: i64,
        result: &Value,
    ) -> Result<Option<TaskExecutionRecord>> {
        self.update_status(execution_id, TaskStatus::Failure, Some(result))
            .await
    }

    pub async fn mark_retry(
        &self,
        execution_id: i64,
        result: &Value,
    ) -> Result<Option<TaskExecutionRecord>> {
        self.update_status(execution_id, TaskStatus::Retry, Some(result))
            .await
    }

    /// Delete records created at least `retention_secs` ago, whatever their
    /// status. A retention of zero clears the ledger.
    pub async fn cleanup_old_tasks(&self, retention_secs: u64) -> Result<u64> {
        let cutoff = Utc::now()
            .timestamp()
            .saturating_sub(secs_to_i64(retention_secs));
        let result = sqlx::query("DELETE FROM task_executions WHERE created_at <= ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        info!(deleted, retention_secs, "old task records removed");
        Ok(deleted)
    }
}

fn decide(existing: Option<TaskExecutionRecord>, time_limit_secs: u64, now: i64) -> Decision {
    let Some(record) = existing else {
        return Decision {
            execute: true,
            reason: DecisionReason::NoRecord,
            record: None,
        };
    };

    let (execute, reason) = match record.status {
        TaskStatus::Success => (false, DecisionReason::Completed),
        TaskStatus::Failure => (true, DecisionReason::PreviouslyFailed),
        _ => {
            // A record that never started is aged from its creation.
            let since = record.started_at.unwrap_or(record.created_at);
            let elapsed = now.saturating_sub(since);
            if elapsed >= secs_to_i64(time_limit_secs).saturating_add(STUCK_GRACE_SECS) {
                (true, DecisionReason::Stuck)
            } else {
                (false, DecisionReason::InFlight)
            }
        }
    };

    Decision {
        execute,
        reason,
        record: Some(record),
    }
}

/// Durations beyond `i64::MAX` seconds clamp instead of wrapping negative.
fn secs_to_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TaskExecutionRecord> {
    let status: String = row.get("status");
    let args: String = row.get("task_args");
    let result: Option<String> = row.get("result");
    Ok(TaskExecutionRecord {
        execution_id: row.get("execution_id"),
        task_name: row.get("task_name"),
        task_args_hash: row.get("task_args_hash"),
        task_args: serde_json::from_str(&args)?,
        correlation_id: row.get("correlation_id"),
        status: status.parse()?,
        result: result
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?,
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        updated_at: row.get("updated_at"),
    })
}
