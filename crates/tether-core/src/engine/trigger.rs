//! Trigger dispatcher: turns external events into runs.
//!
//! Three trigger kinds map to run creation:
//! - named application events, matched by event name and validated against
//!   each matching job's schema
//! - interval ticks from the timer service, with an empty payload
//! - direct invocations, which return a [`RunHandle`] that can await the
//!   run's terminal result
//!
//! A job has exactly one trigger, so dispatch is keyed by job ID plus
//! trigger kind. Disabled jobs reject new dispatches.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use tether_types::error::ValidationError;
use tether_types::invocation::InvokeOptions;
use tether_types::run::ParentLink;
use tether_types::trigger::TriggerKind;
use uuid::Uuid;

use super::clock::{IntervalCallback, TimerError, TimerService};
use super::job::JobDefinition;
use super::launcher::{LaunchRequest, RunHandle, RunLauncher};
use super::registry::JobRegistry;
use super::scheduler::SchedulerError;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while dispatching a trigger.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job '{0}' is not registered")]
    UnknownJob(String),

    #[error("job '{0}' is disabled")]
    JobDisabled(String),

    #[error("job '{job_id}' has a {actual} trigger, not {expected}")]
    TriggerMismatch {
        job_id: String,
        expected: TriggerKind,
        actual: TriggerKind,
    },

    /// A job's schema rejected the payload. No run was created.
    #[error("job '{job_id}': {source}")]
    Validation {
        job_id: String,
        #[source]
        source: ValidationError,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Timer(#[from] TimerError),
}

impl DispatchError {
    /// Whether the request itself was rejected, as opposed to an engine
    /// failure while handling it.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, DispatchError::Scheduler(_) | DispatchError::Timer(_))
    }

    /// Name recorded when this rejection surfaces in a step or run.
    pub fn error_name(&self) -> &'static str {
        match self {
            DispatchError::Validation { .. } => "ValidationError",
            DispatchError::Scheduler(_) | DispatchError::Timer(_) => "EngineError",
            _ => "DispatchError",
        }
    }
}

// ---------------------------------------------------------------------------
// TriggerDispatcher
// ---------------------------------------------------------------------------

pub struct TriggerDispatcher {
    registry: Arc<JobRegistry>,
    launcher: Arc<RunLauncher>,
    timer: Arc<TimerService>,
}

impl TriggerDispatcher {
    pub fn new(registry: Arc<JobRegistry>, launcher: Arc<RunLauncher>, timer: Arc<TimerService>) -> Self {
        Self {
            registry,
            launcher,
            timer,
        }
    }

    /// Start one run per enabled job bound to `event_name`.
    ///
    /// Every matching job's schema is checked before any run is created; a
    /// single rejection rejects the whole event. No matching job is not an
    /// error and returns no handles.
    pub async fn dispatch_event(&self, event_name: &str, payload: Value) -> Result<Vec<RunHandle>, DispatchError> {
        let jobs: Vec<Arc<JobDefinition>> = self
            .registry
            .jobs_for_event(event_name)
            .into_iter()
            .filter(|job| {
                if !job.enabled {
                    tracing::debug!(job_id = %job.id, event = event_name, "skipping disabled job");
                }
                job.enabled
            })
            .collect();

        if jobs.is_empty() {
            tracing::debug!(event = event_name, "no job listens for event");
            return Ok(Vec::new());
        }

        let mut accepted = Vec::with_capacity(jobs.len());
        for job in jobs {
            let payload = validate(&job, payload.clone())?;
            accepted.push((job, payload));
        }

        let mut handles = Vec::with_capacity(accepted.len());
        for (job, payload) in accepted {
            let request = LaunchRequest::new(&job.id, &job.version, TriggerKind::Event, payload);
            handles.push(self.launcher.launch(request).await?);
        }
        tracing::info!(event = event_name, runs = handles.len(), "event dispatched");
        Ok(handles)
    }

    /// Start a run of an interval-triggered job.
    pub async fn dispatch_interval(&self, job_id: &str, fired_at: DateTime<Utc>) -> Result<RunHandle, DispatchError> {
        let job = self.lookup(job_id, TriggerKind::Interval)?;
        tracing::debug!(job_id, %fired_at, "dispatching interval run");
        let request = LaunchRequest::new(&job.id, &job.version, TriggerKind::Interval, json!({}));
        Ok(self.launcher.launch(request).await?)
    }

    /// Start a run of an invocation-triggered job.
    pub async fn invoke(&self, job_id: &str, payload: Value, options: InvokeOptions) -> Result<RunHandle, DispatchError> {
        let job = self.lookup(job_id, TriggerKind::Invoke)?;
        let payload = validate(&job, payload)?;
        let mut request = LaunchRequest::new(&job.id, &job.version, TriggerKind::Invoke, payload);
        request.callback_url = options.callback_url;
        Ok(self.launcher.launch(request).await?)
    }

    /// Launch a child run with a pre-generated ID on behalf of a parent step.
    /// Idempotent per `child_id`.
    pub(crate) async fn launch_child(
        &self,
        child_id: Uuid,
        job_id: &str,
        payload: Value,
        parent: ParentLink,
        callback_url: Option<String>,
    ) -> Result<RunHandle, DispatchError> {
        let job = self.lookup(job_id, TriggerKind::Invoke)?;
        let payload = validate(&job, payload)?;
        let mut request = LaunchRequest::new(&job.id, &job.version, TriggerKind::Invoke, payload);
        request.id = child_id;
        request.parent = Some(parent);
        request.callback_url = callback_url;
        Ok(self.launcher.launch(request).await?)
    }

    /// Register a ticker with the timer service for every enabled interval
    /// job. Returns how many were registered.
    pub fn start_interval_triggers(self: &Arc<Self>) -> Result<usize, DispatchError> {
        let mut registered = 0;
        for (job, seconds) in self.registry.interval_jobs() {
            if !job.enabled {
                continue;
            }
            let dispatcher = Arc::downgrade(self);
            self.timer
                .register_interval(&job.id, Duration::from_secs(seconds), interval_callback(dispatcher))?;
            registered += 1;
        }
        Ok(registered)
    }

    fn lookup(&self, job_id: &str, expected: TriggerKind) -> Result<Arc<JobDefinition>, DispatchError> {
        let job = self
            .registry
            .get(job_id)
            .ok_or_else(|| DispatchError::UnknownJob(job_id.to_string()))?;
        if !job.enabled {
            return Err(DispatchError::JobDisabled(job_id.to_string()));
        }
        let actual = job.trigger.kind();
        if actual != expected {
            return Err(DispatchError::TriggerMismatch {
                job_id: job_id.to_string(),
                expected,
                actual,
            });
        }
        Ok(job)
    }
}

impl std::fmt::Debug for TriggerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDispatcher")
            .field("jobs", &self.registry.len())
            .finish()
    }
}

fn validate(job: &JobDefinition, payload: Value) -> Result<Value, DispatchError> {
    job.trigger.validate(payload).map_err(|source| DispatchError::Validation {
        job_id: job.id.clone(),
        source,
    })
}

fn interval_callback(dispatcher: Weak<TriggerDispatcher>) -> IntervalCallback {
    Arc::new(move |job_id: String, fired_at: DateTime<Utc>| {
        let dispatcher = dispatcher.clone();
        Box::pin(async move {
            let Some(dispatcher) = dispatcher.upgrade() else {
                return;
            };
            if let Err(e) = dispatcher.dispatch_interval(&job_id, fired_at).await {
                tracing::warn!(job_id = %job_id, error = %e, "interval dispatch failed");
            }
        }) as BoxFuture<'static, ()>
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::trigger::{FieldSchema, PayloadSchema, TriggerSpec};

    use crate::engine::checkpoint::CheckpointManager;
    use crate::engine::io::JobIo;
    use crate::engine::job::JobError;
    use crate::engine::scheduler::{ResumeSender, SchedulerCommand};
    use crate::event::EventBus;
    use crate::repository::{BoxCheckpointStore, InMemoryCheckpointStore};

    async fn noop(_payload: Value, _io: JobIo) -> Result<Value, JobError> {
        Ok(json!({}))
    }

    struct Harness {
        dispatcher: Arc<TriggerDispatcher>,
        checkpoint: Arc<CheckpointManager>,
        registry: Arc<JobRegistry>,
        rx: tokio::sync::mpsc::UnboundedReceiver<SchedulerCommand>,
    }

    fn harness() -> Harness {
        let (sender, rx) = ResumeSender::channel();
        let checkpoint = Arc::new(CheckpointManager::new(BoxCheckpointStore::new(
            InMemoryCheckpointStore::new(),
        )));
        let timer = Arc::new(TimerService::new(sender.clone()));
        let launcher = Arc::new(RunLauncher::new(
            Arc::clone(&checkpoint),
            Arc::clone(&timer),
            EventBus::new(16),
            sender,
        ));
        let registry = Arc::new(JobRegistry::new());
        let dispatcher = Arc::new(TriggerDispatcher::new(Arc::clone(&registry), launcher, timer));
        Harness {
            dispatcher,
            checkpoint,
            registry,
            rx,
        }
    }

    fn user_schema() -> PayloadSchema {
        PayloadSchema::new().field("userId", FieldSchema::string())
    }

    #[tokio::test]
    async fn event_creates_one_run_per_matching_job() {
        let h = harness();
        h.registry
            .register(JobDefinition::new("a", "A", "1", TriggerSpec::event("user.created"), noop))
            .unwrap();
        h.registry
            .register(JobDefinition::new("b", "B", "1", TriggerSpec::event("user.created"), noop))
            .unwrap();
        h.registry
            .register(JobDefinition::new("c", "C", "1", TriggerSpec::event("other"), noop))
            .unwrap();

        let handles = h.dispatcher.dispatch_event("user.created", json!({})).await.unwrap();
        let jobs: Vec<_> = handles.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(jobs, vec!["a", "b"]);
        assert_eq!(h.checkpoint.list_runs(None, 10).await.unwrap().len(), 2);

        assert!(h.dispatcher.dispatch_event("nobody.listens", json!({})).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_payload_creates_no_run() {
        let h = harness();
        h.registry
            .register(JobDefinition::new(
                "loose",
                "Loose",
                "1",
                TriggerSpec::event("user.created"),
                noop,
            ))
            .unwrap();
        h.registry
            .register(JobDefinition::new(
                "strict",
                "Strict",
                "1",
                TriggerSpec::event("user.created").with_schema(user_schema()),
                noop,
            ))
            .unwrap();

        let err = h
            .dispatcher
            .dispatch_event("user.created", json!({"userId": 7}))
            .await
            .unwrap_err();
        assert!(matches!(&err, DispatchError::Validation { job_id, .. } if job_id == "strict"));
        assert!(err.is_rejection());
        assert!(h.checkpoint.list_runs(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invoke_requires_invocation_trigger() {
        let h = harness();
        h.registry
            .register(JobDefinition::new("evented", "E", "1", TriggerSpec::event("x"), noop))
            .unwrap();
        h.registry
            .register(JobDefinition::new("off", "Off", "1", TriggerSpec::invoke(), noop).enabled(false))
            .unwrap();

        let err = h
            .dispatcher
            .invoke("evented", json!({}), InvokeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::TriggerMismatch {
                expected: TriggerKind::Invoke,
                actual: TriggerKind::Event,
                ..
            }
        ));
        assert!(matches!(
            h.dispatcher.invoke("off", json!({}), InvokeOptions::default()).await,
            Err(DispatchError::JobDisabled(_))
        ));
        assert!(matches!(
            h.dispatcher.invoke("missing", json!({}), InvokeOptions::default()).await,
            Err(DispatchError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn invoke_applies_schema_defaults_and_callback() {
        let h = harness();
        let schema = PayloadSchema::new().field("name", FieldSchema::string().with_default(json!("Matt")));
        h.registry
            .register(JobDefinition::new(
                "invoke-example-2",
                "Invoke 2",
                "1",
                TriggerSpec::invoke().with_schema(schema),
                noop,
            ))
            .unwrap();

        let handle = h
            .dispatcher
            .invoke(
                "invoke-example-2",
                json!({}),
                InvokeOptions::with_callback("http://localhost:9/callback"),
            )
            .await
            .unwrap();
        let run = h.checkpoint.require_run(handle.run_id).await.unwrap();
        assert_eq!(run.payload, json!({"name": "Matt"}));
        assert_eq!(run.trigger, TriggerKind::Invoke);
        assert_eq!(run.callback_url.as_deref(), Some("http://localhost:9/callback"));
    }

    #[tokio::test(start_paused = true)]
    async fn interval_jobs_tick_with_empty_payload() {
        let mut h = harness();
        h.registry
            .register(JobDefinition::new(
                "schedule-example-1",
                "Schedule",
                "1",
                TriggerSpec::interval(60),
                noop,
            ))
            .unwrap();
        assert_eq!(h.dispatcher.start_interval_triggers().unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(185)).await;

        let runs = h.checkpoint.list_runs(None, 10).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs.iter().all(|r| r.payload == json!({}) && r.trigger == TriggerKind::Interval));

        let mut starts = 0;
        while let Ok(SchedulerCommand::Drive { .. }) = h.rx.try_recv() {
            starts += 1;
        }
        assert_eq!(starts, 3);
    }
}
