//! Run lifecycle events broadcast by the engine.
//!
//! `RunEvent` is Clone + Send + Sync for use with tokio broadcast channels.
//! `RunEventKind` is the discriminant observers register against.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::{ErrorInfo, StepKind};
use crate::trigger::TriggerKind;

/// Events emitted while runs are driven.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run was persisted and enqueued.
    RunStarted {
        run_id: Uuid,
        job_id: String,
        trigger: TriggerKind,
    },

    /// A run suspended on an unresolved step.
    RunWaiting {
        run_id: Uuid,
        job_id: String,
        step_key: String,
    },

    /// A step recorded a successful outcome.
    StepCompleted {
        run_id: Uuid,
        step_key: String,
        kind: StepKind,
    },

    /// A step try failed.
    StepFailed {
        run_id: Uuid,
        step_key: String,
        error: ErrorInfo,
        /// Whether a retry was scheduled.
        will_retry: bool,
    },

    /// A status record moved to a new version.
    StatusUpdated {
        run_id: Uuid,
        key: String,
        version: u64,
    },

    /// A run completed successfully.
    RunSucceeded {
        run_id: Uuid,
        job_id: String,
        output: Value,
    },

    /// A run failed.
    RunFailed {
        run_id: Uuid,
        job_id: String,
        error: ErrorInfo,
    },
}

/// Discriminant of [`RunEvent`], used as the observer registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    RunWaiting,
    StepCompleted,
    StepFailed,
    StatusUpdated,
    RunSucceeded,
    RunFailed,
}

impl RunEvent {
    pub fn kind(&self) -> RunEventKind {
        match self {
            RunEvent::RunStarted { .. } => RunEventKind::RunStarted,
            RunEvent::RunWaiting { .. } => RunEventKind::RunWaiting,
            RunEvent::StepCompleted { .. } => RunEventKind::StepCompleted,
            RunEvent::StepFailed { .. } => RunEventKind::StepFailed,
            RunEvent::StatusUpdated { .. } => RunEventKind::StatusUpdated,
            RunEvent::RunSucceeded { .. } => RunEventKind::RunSucceeded,
            RunEvent::RunFailed { .. } => RunEventKind::RunFailed,
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::RunWaiting { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::StatusUpdated { run_id, .. }
            | RunEvent::RunSucceeded { run_id, .. }
            | RunEvent::RunFailed { run_id, .. } => *run_id,
        }
    }

    /// Whether the event marks the end of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunSucceeded { .. } | RunEvent::RunFailed { .. }
        )
    }
}
