//! Job state reporting.
//!
//! Jobs publish [`JobEvent`]s through [`JobContext::update_state`] and the
//! runner's own lifecycle hooks. A [`JobObserver`] decides where they go:
//! the tracing log, one JSON object per line on stderr, or an in-process
//! channel for callers that want to watch a job.
//!
//! Events never go to stdout, which stays reserved for command results.
//!
//! [`JobContext::update_state`]: crate::jobs::JobContext::update_state

use std::io::Write;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// A single state change of a job.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        job_id: String,
        task_name: String,
        attempt: u32,
    },
    /// Free-form state published by the job body, e.g. `PROGRESS` with
    /// `{"progress": 40}`.
    State {
        job_id: String,
        task_name: String,
        state: String,
        meta: Value,
    },
    Retrying {
        job_id: String,
        task_name: String,
        attempt: u32,
        countdown_secs: u64,
        error: String,
    },
    Skipped {
        job_id: String,
        task_name: String,
        reason: String,
    },
    Finished {
        job_id: String,
        task_name: String,
        status: String,
    },
}

/// Receives job events. Implementations must not block.
pub trait JobObserver: Send + Sync {
    fn report(&self, event: JobEvent);
}

/// Logs every event through `tracing`.
pub struct TracingObserver;

impl JobObserver for TracingObserver {
    fn report(&self, event: JobEvent) {
        match &event {
            JobEvent::Started {
                job_id,
                task_name,
                attempt,
            } => tracing::info!(%job_id, %task_name, attempt, "job started"),
            JobEvent::State {
                job_id,
                task_name,
                state,
                meta,
            } => tracing::info!(%job_id, %task_name, %state, %meta, "job state"),
            JobEvent::Retrying {
                job_id,
                task_name,
                attempt,
                countdown_secs,
                error,
            } => tracing::warn!(
                %job_id,
                %task_name,
                attempt,
                countdown_secs,
                %error,
                "job failed, retrying"
            ),
            JobEvent::Skipped {
                job_id,
                task_name,
                reason,
            } => tracing::info!(%job_id, %task_name, %reason, "job skipped"),
            JobEvent::Finished {
                job_id,
                task_name,
                status,
            } => tracing::info!(%job_id, %task_name, %status, "job finished"),
        }
    }
}

/// Machine-readable events: one JSON object per line on stderr.
pub struct JsonObserver;

impl JobObserver for JsonObserver {
    fn report(&self, event: JobEvent) {
        if let Ok(line) = serde_json::to_string(&event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// Forwards events to an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl JobObserver for ChannelObserver {
    fn report(&self, event: JobEvent) {
        // The receiver may have gone away; events are best effort.
        let _ = self.tx.send(event);
    }
}

/// Progress mode for the CLI.
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    /// Events go to the log (stderr, filtered by `RAGDOCK_LOG`).
    Log,
    /// Events go to stderr as JSON lines.
    Json,
}

impl ProgressMode {
    pub fn observer(&self) -> Box<dyn JobObserver> {
        match self {
            ProgressMode::Log => Box::new(TracingObserver),
            ProgressMode::Json => Box::new(JsonObserver),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = JobEvent::State {
            job_id: "j1".to_string(),
            task_name: "t".to_string(),
            state: "PROGRESS".to_string(),
            meta: serde_json::json!({"progress": 40}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state");
        assert_eq!(json["meta"]["progress"], 40);
    }

    #[tokio::test]
    async fn test_channel_observer_forwards() {
        let (observer, mut rx) = ChannelObserver::new();
        observer.report(JobEvent::Finished {
            job_id: "j".to_string(),
            task_name: "t".to_string(),
            status: "SUCCESS".to_string(),
        });
        match rx.recv().await.unwrap() {
            JobEvent::Finished { status, .. } => assert_eq!(status, "SUCCESS"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.report(JobEvent::Skipped {
            job_id: "j".to_string(),
            task_name: "t".to_string(),
            reason: "completed".to_string(),
        });
    }
}
