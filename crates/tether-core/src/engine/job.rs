//! Job definitions, the job body contract, and the error type job bodies see.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use tether_types::step::ErrorInfo;
use tether_types::trigger::TriggerSpec;

use super::checkpoint::CheckpointError;
use super::integration::{Integration, IntegrationSet};
use super::io::JobIo;

// ---------------------------------------------------------------------------
// JobError
// ---------------------------------------------------------------------------

/// Errors surfaced to (and returned by) job bodies.
///
/// `Suspended` is not a failure: it tells the scheduler that the run reached
/// a step without a result and must be resumed later. Bodies propagate it
/// with `?` and must not swallow it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// The run is waiting on a timer, a retry or a child run.
    #[error("run suspended")]
    Suspended,

    /// A step recorded a terminal failure. Replays return the same error.
    #[error("step '{step_key}' failed: {error}")]
    StepFailed { step_key: String, error: ErrorInfo },

    /// Two steps in one run used the same key.
    #[error("duplicate step key '{0}'")]
    DuplicateStepKey(String),

    /// A step key was reused for a different kind of step on replay.
    #[error("step '{step_key}' was recorded as {recorded}, not {requested}")]
    StepKindMismatch {
        step_key: String,
        recorded: &'static str,
        requested: &'static str,
    },

    /// An invocation named a job that is not registered.
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    /// A background call named an integration the job does not carry.
    #[error("unknown integration '{0}'")]
    UnknownIntegration(String),

    /// A status was created without a label.
    #[error("status '{0}' must be created with a label")]
    MissingStatusLabel(String),

    /// A replayed batch passed a different number of payloads than the
    /// drive that recorded it.
    #[error("batch '{step_key}' recorded {recorded} payloads, replay passed {given}")]
    BatchSizeChanged {
        step_key: String,
        recorded: usize,
        given: usize,
    },

    /// A step value could not be converted to or from JSON.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Checkpoint persistence failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// An error raised by the job body itself.
    #[error("{0}")]
    Failed(String),
}

impl JobError {
    /// Construct a body-level failure.
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, JobError::Suspended)
    }

    /// Whether this is a recorded timeout failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, JobError::StepFailed { error, .. } if error.name == "TimeoutError")
    }

    /// Descriptor recorded on a run that this error failed.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            JobError::StepFailed { error, .. } => error.clone(),
            JobError::DuplicateStepKey(_)
            | JobError::StepKindMismatch { .. }
            | JobError::UnknownJob(_)
            | JobError::UnknownIntegration(_)
            | JobError::MissingStatusLabel(_)
            | JobError::BatchSizeChanged { .. } => ErrorInfo::new("DefinitionError", self.to_string()),
            JobError::Serialization(_) => ErrorInfo::new("SerializationError", self.to_string()),
            JobError::Checkpoint(_) => ErrorInfo::new("CheckpointError", self.to_string()),
            JobError::Suspended | JobError::Failed(_) => ErrorInfo::new("Error", self.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// JobHandler
// ---------------------------------------------------------------------------

/// The body of a job.
///
/// Called once per drive of a run. Bodies must be deterministic in the
/// sequence of step keys they produce, given the same recorded results.
pub trait JobHandler: Send + Sync {
    fn run(&self, payload: Value, io: JobIo) -> BoxFuture<'static, Result<Value, JobError>>;
}

/// Blanket implementation so async closures and functions can be used as
/// job bodies.
impl<F, Fut> JobHandler for F
where
    F: Fn(Value, JobIo) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    fn run(&self, payload: Value, io: JobIo) -> BoxFuture<'static, Result<Value, JobError>> {
        Box::pin(self(payload, io))
    }
}

// ---------------------------------------------------------------------------
// JobDefinition
// ---------------------------------------------------------------------------

/// A registered job: metadata, its single trigger, its body and the
/// integrations injected into it.
#[derive(Clone)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    /// Disabled jobs reject new dispatches; existing runs still finish.
    pub enabled: bool,
    pub trigger: TriggerSpec,
    pub handler: Arc<dyn JobHandler>,
    pub integrations: IntegrationSet,
}

impl JobDefinition {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        trigger: TriggerSpec,
        handler: impl JobHandler + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            enabled: true,
            trigger,
            handler: Arc::new(handler),
            integrations: IntegrationSet::default(),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_integration(mut self, id: impl Into<String>, integration: Arc<dyn Integration>) -> Self {
        self.integrations.insert(id, integration);
        self
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("enabled", &self.enabled)
            .field("trigger", &self.trigger.kind())
            .field("integrations", &self.integrations.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_failure_keeps_recorded_error() {
        let err = JobError::StepFailed {
            step_key: "task-1".to_string(),
            error: ErrorInfo::new("TaskError", "Forced error"),
        };
        assert_eq!(err.to_error_info(), ErrorInfo::new("TaskError", "Forced error"));
        assert!(err.to_string().contains("task-1"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn timeout_is_detected_from_recorded_name() {
        let err = JobError::StepFailed {
            step_key: "call".to_string(),
            error: ErrorInfo::new("TimeoutError", "exceeded 30000 ms"),
        };
        assert!(err.is_timeout());
    }

    #[test]
    fn definition_errors_are_classified() {
        let info = JobError::DuplicateStepKey("a".to_string()).to_error_info();
        assert_eq!(info.name, "DefinitionError");
        assert!(info.message.contains("duplicate step key 'a'"));

        let info = JobError::BatchSizeChanged {
            step_key: "batch".to_string(),
            recorded: 3,
            given: 2,
        }
        .to_error_info();
        assert_eq!(info.name, "DefinitionError");
        assert!(info.message.contains("recorded 3 payloads"));
    }
}
