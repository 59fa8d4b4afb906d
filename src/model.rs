use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schedule::Schedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Time,
    Event,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Time => write!(f, "time"),
            JobKind::Event => write!(f, "event"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "time" => Ok(JobKind::Time),
            "event" => Ok(JobKind::Event),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// What to do when a new run of a definition would overlap a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    Forbid,
    Allow,
    Replace,
}

impl std::fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyPolicy::Forbid => write!(f, "forbid"),
            ConcurrencyPolicy::Allow => write!(f, "allow"),
            ConcurrencyPolicy::Replace => write!(f, "replace"),
        }
    }
}

impl std::str::FromStr for ConcurrencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "forbid" => Ok(ConcurrencyPolicy::Forbid),
            "allow" => Ok(ConcurrencyPolicy::Allow),
            "replace" => Ok(ConcurrencyPolicy::Replace),
            other => Err(format!("unknown concurrency policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
    Orphaned,
    Skipped,
}

impl RunState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded
                | RunState::Failed
                | RunState::Canceled
                | RunState::TimedOut
                | RunState::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Assigned => "ASSIGNED",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::Canceled => "CANCELED",
            RunState::TimedOut => "TIMED_OUT",
            RunState::Orphaned => "ORPHANED",
            RunState::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RunState::Pending),
            "ASSIGNED" => Ok(RunState::Assigned),
            "RUNNING" => Ok(RunState::Running),
            "SUCCEEDED" => Ok(RunState::Succeeded),
            "FAILED" => Ok(RunState::Failed),
            "CANCELED" => Ok(RunState::Canceled),
            "TIMED_OUT" => Ok(RunState::TimedOut),
            "ORPHANED" => Ok(RunState::Orphaned),
            "SKIPPED" => Ok(RunState::Skipped),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// Orthogonal to `RunState`: set while a detached-but-reachable worker asks
/// whether it may finish its current run. A run in CONFIRMING is excluded
/// from orphan scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContinuationState {
    None,
    Confirming,
}

impl ContinuationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinuationState::None => "NONE",
            ContinuationState::Confirming => "CONFIRMING",
        }
    }
}

impl std::str::FromStr for ContinuationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NONE" => Ok(ContinuationState::None),
            "CONFIRMING" => Ok(ContinuationState::Confirming),
            other => Err(format!("unknown continuation state: {other}")),
        }
    }
}

/// A named job template. Runs reference a definition and carry everything
/// else themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub kind: JobKind,
    pub command_name: String,
    /// Opaque argument map handed to the executor as-is.
    pub default_args: serde_json::Value,
    pub schedule: Schedule,
    pub timeout_seconds: i32,
    pub max_retries: i32,
    pub retry_backoff_seconds: i32,
    pub concurrency_policy: ConcurrencyPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt of a definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_definition_id: Uuid,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub state: RunState,
    pub attempt: i32,
    /// Bumped on every update; conditional updates match on it.
    pub version: i64,
    /// Epoch under which the run was dispatched; part of the fencing check
    /// on RUNNING and terminal transitions.
    pub leader_epoch: Option<i64>,
    pub assigned_worker_id: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_summary: String,
    pub log_ref: String,
    pub idempotency_key: Option<String>,
    pub continuation_state: ContinuationState,
    pub continuation_check_started_at: Option<DateTime<Utc>>,
    pub continuation_check_deadline_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRun {
    /// Idempotency key for a time-materialized run.
    pub fn time_key(definition_id: Uuid, scheduled_for: DateTime<Utc>) -> String {
        format!("time:{}:{}", definition_id, scheduled_for.timestamp())
    }

    /// Idempotency key for an event-triggered run. `anchor` is the event's
    /// dedupe key when present, otherwise the event id.
    pub fn event_key(anchor: &str, definition_id: Uuid) -> String {
        format!("event:{anchor}:{definition_id}")
    }
}

/// External trigger record, consumed by the leader exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}
