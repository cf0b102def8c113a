//! Run scheduler: owns the life cycle of every run.
//!
//! A drive replays the job body from the start. Steps that already have a
//! checkpoint return their recorded outcome, and the first step without one
//! either resolves in place or suspends the run. A suspended run holds no
//! task while it waits; timers, child completions and recovery feed resume
//! events back through one command channel.
//!
//! Drives of the same run are serialized by a per-run async mutex. Different
//! runs drive concurrently on their own tasks.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::Value;
use tether_types::event::RunEvent;
use tether_types::run::{RunCursor, RunRecord, RunStatus};
use tether_types::step::ErrorInfo;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event::EventBus;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::clock::TimerService;
use super::invocation::InvocationCoordinator;
use super::io::{JobIo, RunContext, RunServices};
use super::job::JobError;
use super::launcher::{LaunchRequest, RunHandle, RunLauncher};
use super::registry::JobRegistry;
use super::status::StatusChannel;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Why a run is being driven.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeEvent {
    /// First drive after the run was persisted.
    Start,
    /// A wait elapsed or a retry became due.
    TimerFired { step_key: String },
    /// Every child of an invocation step has a result.
    InvocationResolved { step_key: String },
    /// Re-drive after a restart.
    Recover,
}

impl ResumeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResumeEvent::Start => "start",
            ResumeEvent::TimerFired { .. } => "timer_fired",
            ResumeEvent::InvocationResolved { .. } => "invocation_resolved",
            ResumeEvent::Recover => "recover",
        }
    }
}

#[derive(Debug)]
pub enum SchedulerCommand {
    Drive { run_id: Uuid, event: ResumeEvent },
    Shutdown,
}

/// Sending half of the scheduler's command channel.
#[derive(Debug, Clone)]
pub struct ResumeSender(mpsc::UnboundedSender<SchedulerCommand>);

impl ResumeSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SchedulerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Enqueue a drive of `run_id`.
    pub fn resume(&self, run_id: Uuid, event: ResumeEvent) -> Result<(), SchedulerError> {
        self.0
            .send(SchedulerCommand::Drive { run_id, event })
            .map_err(|_| SchedulerError::ShutDown)
    }

    /// Ask the scheduler loop to stop after the commands already queued.
    pub fn shutdown(&self) {
        let _ = self.0.send(SchedulerCommand::Shutdown);
    }
}

// ---------------------------------------------------------------------------
// Errors / state
// ---------------------------------------------------------------------------

/// Errors that can occur while driving runs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("job '{0}' is not registered")]
    UnknownJob(String),

    #[error("scheduler is shut down")]
    ShutDown,
}

/// Where a run stands after a drive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Step the run is suspended on, if waiting.
    pub waiting_on: Option<String>,
}

impl From<&RunRecord> for RunState {
    fn from(run: &RunRecord) -> Self {
        Self {
            run_id: run.id,
            status: run.status,
            waiting_on: run.cursor.waiting_on.clone(),
        }
    }
}

/// How a drive of the job body ended.
enum DriveOutcome {
    Waiting,
    Completed(Value),
    Failed(ErrorInfo),
}

// ---------------------------------------------------------------------------
// RunScheduler
// ---------------------------------------------------------------------------

pub struct RunScheduler {
    registry: Arc<JobRegistry>,
    checkpoint: Arc<CheckpointManager>,
    timer: Arc<TimerService>,
    events: EventBus,
    launcher: Arc<RunLauncher>,
    invocations: Arc<InvocationCoordinator>,
    services: Arc<RunServices>,
    sender: ResumeSender,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl RunScheduler {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<JobRegistry>,
        checkpoint: Arc<CheckpointManager>,
        timer: Arc<TimerService>,
        events: EventBus,
        launcher: Arc<RunLauncher>,
        invocations: Arc<InvocationCoordinator>,
        statuses: Arc<StatusChannel>,
        sender: ResumeSender,
    ) -> Self {
        let services = Arc::new(RunServices {
            checkpoint: Arc::clone(&checkpoint),
            timer: Arc::clone(&timer),
            executor: super::executor::TaskExecutor::new(
                Arc::clone(&checkpoint),
                Arc::clone(&timer),
                events.clone(),
            ),
            invocations: Arc::clone(&invocations),
            statuses,
        });
        Self {
            registry,
            checkpoint,
            timer,
            events,
            launcher,
            invocations,
            services,
            sender,
            locks: DashMap::new(),
        }
    }

    /// Unfinished runs holding a drive lock.
    pub fn active_runs(&self) -> usize {
        self.locks.len()
    }

    /// Start the command loop. Each drive runs on its own task.
    pub fn spawn(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<SchedulerCommand>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    SchedulerCommand::Drive { run_id, event } => {
                        let scheduler = Arc::clone(&scheduler);
                        tokio::spawn(async move {
                            let kind = event.as_str();
                            if let Err(e) = scheduler.resume(run_id, event).await {
                                tracing::error!(run_id = %run_id, event = kind, error = %e, "drive failed");
                            }
                        });
                    }
                    SchedulerCommand::Shutdown => break,
                }
            }
            tracing::info!("run scheduler stopped");
        })
    }

    /// Start a run of `job_id` directly, bypassing trigger matching.
    pub async fn start(&self, job_id: &str, payload: Value) -> Result<RunHandle, SchedulerError> {
        let job = self
            .registry
            .get(job_id)
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;
        let request = LaunchRequest::new(&job.id, &job.version, job.trigger.kind(), payload);
        self.launcher.launch(request).await
    }

    /// Re-drive every unfinished run. Returns how many were enqueued.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        let runs = self.checkpoint.list_unfinished_runs().await?;
        for run in &runs {
            self.sender.resume(run.id, ResumeEvent::Recover)?;
        }
        if !runs.is_empty() {
            tracing::info!(runs = runs.len(), "recovering unfinished runs");
        }
        Ok(runs.len())
    }

    /// Drive `run_id` until it suspends or finishes.
    ///
    /// Resume events for a terminal run are no-ops.
    pub async fn resume(&self, run_id: Uuid, event: ResumeEvent) -> Result<RunState, SchedulerError> {
        let lock = Arc::clone(&self.locks.entry(run_id).or_default());
        let _guard = lock.lock().await;

        let mut run = self.checkpoint.require_run(run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!(run_id = %run_id, event = event.as_str(), "run already finished");
            self.locks.remove(&run_id);
            return Ok(RunState::from(&run));
        }

        if let ResumeEvent::TimerFired { step_key } = &event {
            self.checkpoint.fire_timer(run_id, step_key, self.timer.now()).await?;
        }

        let Some(job) = self.registry.get(&run.job_id) else {
            let error = ErrorInfo::new("DefinitionError", format!("job '{}' is not registered", run.job_id));
            return self.finish(run, DriveOutcome::Failed(error)).await;
        };

        run.status = RunStatus::Running;
        run.updated_at = self.timer.now();
        self.checkpoint.checkpoint_run(&run).await?;

        let recorded = self.checkpoint.list_steps(run_id).await?.len();
        let ctx = Arc::new(RunContext::new(run_id, &run.job_id, recorded));
        let io = JobIo::new(Arc::clone(&ctx), Arc::clone(&self.services), Arc::clone(&job));
        let payload = run.payload.clone();

        tracing::debug!(
            run_id = %run_id,
            job_id = %run.job_id,
            event = event.as_str(),
            recorded,
            "driving run"
        );

        let body = AssertUnwindSafe(async move { job.handler.run(payload, io).await });
        let outcome = match body.catch_unwind().await {
            Ok(_) if ctx.is_suspended() => DriveOutcome::Waiting,
            Ok(Ok(output)) => DriveOutcome::Completed(output),
            Ok(Err(JobError::Suspended)) => DriveOutcome::Waiting,
            Ok(Err(JobError::Checkpoint(e))) => {
                tracing::error!(run_id = %run_id, error = %e, "checkpoint failure during drive");
                return Err(SchedulerError::Checkpoint(e));
            }
            Ok(Err(e)) => DriveOutcome::Failed(e.to_error_info()),
            Err(panic) => DriveOutcome::Failed(ErrorInfo::new("Panic", panic_message(panic.as_ref()))),
        };

        run.cursor = RunCursor {
            resolved_steps: ctx.resolved(),
            waiting_on: ctx.waiting_on(),
        };
        self.finish(run, outcome).await
    }

    async fn finish(&self, mut run: RunRecord, outcome: DriveOutcome) -> Result<RunState, SchedulerError> {
        let now = self.timer.now();
        run.updated_at = now;

        match outcome {
            DriveOutcome::Waiting => {
                run.status = RunStatus::Waiting;
                self.checkpoint.checkpoint_run(&run).await?;
                let step_key = run.cursor.waiting_on.clone().unwrap_or_default();
                tracing::debug!(run_id = %run.id, step_key = %step_key, "run waiting");
                self.events.publish(RunEvent::RunWaiting {
                    run_id: run.id,
                    job_id: run.job_id.clone(),
                    step_key,
                });
                return Ok(RunState::from(&run));
            }
            DriveOutcome::Completed(output) => {
                run.status = RunStatus::Completed;
                run.output = Some(output.clone());
                run.cursor.waiting_on = None;
                run.completed_at = Some(now);
                self.checkpoint.checkpoint_run(&run).await?;
                tracing::info!(run_id = %run.id, job_id = %run.job_id, "run completed");
                self.events.publish(RunEvent::RunSucceeded {
                    run_id: run.id,
                    job_id: run.job_id.clone(),
                    output,
                });
            }
            DriveOutcome::Failed(error) => {
                run.status = RunStatus::Failed;
                run.error = Some(error.clone());
                run.cursor.waiting_on = None;
                run.completed_at = Some(now);
                self.checkpoint.checkpoint_run(&run).await?;
                tracing::info!(run_id = %run.id, job_id = %run.job_id, error = %error, "run failed");
                self.events.publish(RunEvent::RunFailed {
                    run_id: run.id,
                    job_id: run.job_id.clone(),
                    error,
                });
            }
        }

        self.launcher.complete(&run);
        self.invocations.on_run_terminal(&run).await;
        self.services.statuses.forget_run(run.id);
        self.locks.remove(&run.id);
        Ok(RunState::from(&run))
    }
}

impl std::fmt::Debug for RunScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunScheduler")
            .field("active_runs", &self.active_runs())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "job body panicked".to_string()
    }
}
