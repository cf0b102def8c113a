//! Step records: the checkpointed units of work inside a run.
//!
//! A step is keyed by `(run_id, step_key)`. Once a step reaches `Completed`
//! or `Failed` its record is immutable; replays read the recorded outcome
//! instead of re-executing the work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::invocation::InvocationResult;

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// Serializable failure descriptor recorded for failed steps and runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error class, e.g. `"TaskError"`, `"TimeoutError"`, `"ValidationError"`.
    pub name: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

// ---------------------------------------------------------------------------
// StepKind / StepState
// ---------------------------------------------------------------------------

/// What a step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Task,
    Wait,
    Invocation,
    BackgroundCall,
    Status,
    Random,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepKind::Task => "task",
            StepKind::Wait => "wait",
            StepKind::Invocation => "invocation",
            StepKind::BackgroundCall => "background_call",
            StepKind::Status => "status",
            StepKind::Random => "random",
        }
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(StepKind::Task),
            "wait" => Ok(StepKind::Wait),
            "invocation" => Ok(StepKind::Invocation),
            "background_call" => Ok(StepKind::BackgroundCall),
            "status" => Ok(StepKind::Status),
            "random" => Ok(StepKind::Random),
            other => Err(format!("invalid step kind: '{other}'")),
        }
    }
}

/// Recording state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Waiting on a timer (wait or retry backoff) or on child runs.
    Pending,
    /// A retry backoff elapsed; the next replay re-attempts the work.
    Ready,
    Completed,
    Failed,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepState::Completed | StepState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::Ready => "ready",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepState::Pending),
            "ready" => Ok(StepState::Ready),
            "completed" => Ok(StepState::Completed),
            "failed" => Ok(StepState::Failed),
            other => Err(format!("invalid step state: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRecord
// ---------------------------------------------------------------------------

/// Checkpoint of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: Uuid,
    /// Caller-supplied key, unique within the run.
    pub step_key: String,
    pub kind: StepKind,
    pub state: StepState,
    /// Order in which the step was first recorded (assigned by the store).
    #[serde(default)]
    pub seq: u64,
    /// Number of tries made so far (tasks and background calls).
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// When a pending timer (wait or retry backoff) is due.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    /// Overall deadline for retried operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Child run ids of an invocation step, in payload order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Uuid>,
    /// One slot per child; filled as children reach a terminal state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_results: Vec<Option<InvocationResult>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn base(
        run_id: Uuid,
        step_key: impl Into<String>,
        kind: StepKind,
        state: StepState,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            step_key: step_key.into(),
            kind,
            state,
            seq: 0,
            attempt: 0,
            output: None,
            error: None,
            wake_at: None,
            deadline: None,
            children: Vec::new(),
            child_results: Vec::new(),
            created_at: now,
            completed_at: None,
        }
    }

    /// A step that resolved successfully on first recording.
    pub fn completed(
        run_id: Uuid,
        step_key: impl Into<String>,
        kind: StepKind,
        output: Value,
        now: DateTime<Utc>,
    ) -> Self {
        let mut rec = Self::base(run_id, step_key, kind, StepState::Completed, now);
        rec.output = Some(output);
        rec.completed_at = Some(now);
        rec
    }

    /// A step that failed terminally on first recording.
    pub fn failed(
        run_id: Uuid,
        step_key: impl Into<String>,
        kind: StepKind,
        error: ErrorInfo,
        now: DateTime<Utc>,
    ) -> Self {
        let mut rec = Self::base(run_id, step_key, kind, StepState::Failed, now);
        rec.error = Some(error);
        rec.completed_at = Some(now);
        rec
    }

    /// A step waiting on a timer or on child runs.
    pub fn pending(
        run_id: Uuid,
        step_key: impl Into<String>,
        kind: StepKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self::base(run_id, step_key, kind, StepState::Pending, now)
    }

    /// Whether every child slot of an invocation step has a result.
    pub fn all_children_resolved(&self) -> bool {
        self.child_results.iter().all(Option::is_some)
    }
}
