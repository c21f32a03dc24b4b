use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::auth::CredentialBundle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Idle,
    Running,
    Completed,
    /// Reserved for a worker-join fault; ordinary session failures never
    /// put the batch here.
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Idle => "idle",
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Error => "error",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(BatchStatus::Idle),
            "running" => Ok(BatchStatus::Running),
            "completed" => Ok(BatchStatus::Completed),
            "error" => Ok(BatchStatus::Error),
            other => Err(format!("unknown batch status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LastSuccess {
    pub email: String,
    pub completed_at: DateTime<Utc>,
    pub credentials: CredentialBundle,
}

#[derive(Debug)]
struct BatchStateInner {
    status: BatchStatus,
    step: String,
    total_target: u32,
    total_registered: u32,
    total_failed: u32,
    concurrency: u32,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    last_success: Option<LastSuccess>,
}

impl Default for BatchStateInner {
    fn default() -> Self {
        Self {
            status: BatchStatus::Idle,
            step: "idle".to_string(),
            total_target: 0,
            total_registered: 0,
            total_failed: 0,
            concurrency: 0,
            started_at: None,
            finished_at: None,
            last_success: None,
        }
    }
}

/// Serializable view of the batch, the one thing `GetState` hands out.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub status: BatchStatus,
    pub step: String,
    pub total_target: u32,
    pub total_registered: u32,
    pub total_failed: u32,
    pub concurrency: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_success: Option<LastSuccess>,
}

/// What `start_batch` resolves to after the full join.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub target: u32,
    pub registered: u32,
    pub failed: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Shared mutable batch state. One per orchestrator; every mutation happens
/// through these methods so the registered+failed ≤ target invariant holds.
#[derive(Debug, Clone, Default)]
pub struct BatchState {
    inner: Arc<Mutex<BatchStateInner>>,
}

impl BatchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically moves Idle → Running, rejecting a concurrent batch.
    pub fn try_begin(&self, target: u32, concurrency: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.status == BatchStatus::Running {
            return false;
        }
        *inner = BatchStateInner {
            status: BatchStatus::Running,
            step: "starting".to_string(),
            total_target: target,
            concurrency,
            started_at: Some(Utc::now()),
            ..BatchStateInner::default()
        };
        true
    }

    pub fn status(&self) -> BatchStatus {
        self.inner.lock().unwrap().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == BatchStatus::Running
    }

    pub fn set_step(&self, step: impl Into<String>) {
        self.inner.lock().unwrap().step = step.into();
    }

    pub fn record_success(&self, email: &str, credentials: CredentialBundle) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_registered += 1;
        inner.last_success = Some(LastSuccess {
            email: email.to_string(),
            completed_at: Utc::now(),
            credentials,
        });
    }

    pub fn record_failure(&self) {
        self.inner.lock().unwrap().total_failed += 1;
    }

    pub fn counts(&self) -> (u32, u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.total_registered, inner.total_failed, inner.total_target)
    }

    /// Closes the batch with its final status and progress text.
    pub fn finish(&self, status: BatchStatus) -> BatchReport {
        let mut inner = self.inner.lock().unwrap();
        inner.status = status;
        inner.finished_at = Some(Utc::now());
        inner.step = format!(
            "finished: {}/{} registered, {} failed",
            inner.total_registered, inner.total_target, inner.total_failed
        );
        BatchReport {
            status: inner.status,
            target: inner.total_target,
            registered: inner.total_registered,
            failed: inner.total_failed,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
        }
    }

    /// Zeroes everything back to the idle shape.
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = BatchStateInner::default();
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let inner = self.inner.lock().unwrap();
        BatchSnapshot {
            status: inner.status,
            step: inner.step.clone(),
            total_target: inner.total_target,
            total_registered: inner.total_registered,
            total_failed: inner.total_failed,
            concurrency: inner.concurrency,
            started_at: inner.started_at,
            finished_at: inner.finished_at,
            last_success: inner.last_success.clone(),
        }
    }
}
