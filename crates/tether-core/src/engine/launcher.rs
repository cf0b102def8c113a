//! Run launcher: persists new runs and enqueues their first drive.
//!
//! This is the "start" half of the run scheduler. Triggers and the
//! invocation coordinator launch runs through it, and the scheduler reports
//! terminal runs back to it so that [`RunHandle`]s can observe completion.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tether_types::event::RunEvent;
use tether_types::invocation::InvocationResult;
use tether_types::run::{ParentLink, RunRecord, RunStatus};
use tether_types::step::ErrorInfo;
use tether_types::trigger::TriggerKind;
use tokio::sync::watch;
use uuid::Uuid;

use crate::event::EventBus;

use super::checkpoint::CheckpointManager;
use super::clock::TimerService;
use super::scheduler::{ResumeEvent, ResumeSender, SchedulerError};

// ---------------------------------------------------------------------------
// LaunchRequest / RunHandle
// ---------------------------------------------------------------------------

/// Everything needed to persist a new run.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Pre-generated run ID. Launching the same ID twice is idempotent.
    pub id: Uuid,
    pub job_id: String,
    pub job_version: String,
    pub trigger: TriggerKind,
    pub payload: Value,
    pub parent: Option<ParentLink>,
    pub callback_url: Option<String>,
}

impl LaunchRequest {
    pub fn new(job_id: impl Into<String>, job_version: impl Into<String>, trigger: TriggerKind, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id: job_id.into(),
            job_version: job_version.into(),
            trigger,
            payload,
            parent: None,
            callback_url: None,
        }
    }
}

/// Handle to a launched run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub job_id: String,
    /// `false` if the run already existed (idempotent relaunch).
    pub created: bool,
    rx: watch::Receiver<Option<InvocationResult>>,
}

impl RunHandle {
    /// Wait until the run reaches a terminal state.
    pub async fn wait_for_completion(mut self) -> Result<InvocationResult, SchedulerError> {
        loop {
            if let Some(result) = self.rx.borrow_and_update().clone() {
                return Ok(result);
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().clone().ok_or(SchedulerError::ShutDown);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RunLauncher
// ---------------------------------------------------------------------------

pub struct RunLauncher {
    checkpoint: Arc<CheckpointManager>,
    timer: Arc<TimerService>,
    events: EventBus,
    sender: ResumeSender,
    completions: DashMap<Uuid, watch::Sender<Option<InvocationResult>>>,
}

impl RunLauncher {
    pub fn new(
        checkpoint: Arc<CheckpointManager>,
        timer: Arc<TimerService>,
        events: EventBus,
        sender: ResumeSender,
    ) -> Self {
        Self {
            checkpoint,
            timer,
            events,
            sender,
            completions: DashMap::new(),
        }
    }

    /// Persist the run described by `request` and enqueue its first drive.
    ///
    /// If a run with the same ID already exists nothing is re-enqueued; the
    /// returned handle still observes its completion.
    pub async fn launch(&self, request: LaunchRequest) -> Result<RunHandle, SchedulerError> {
        let rx = self
            .completions
            .entry(request.id)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe();

        let mut run = RunRecord::new(
            request.id,
            &request.job_id,
            &request.job_version,
            request.trigger,
            request.payload,
            self.timer.now(),
        );
        run.parent = request.parent;
        run.callback_url = request.callback_url;

        let created = self.checkpoint.create_run(&run).await?;
        if created {
            tracing::info!(
                run_id = %run.id,
                job_id = %run.job_id,
                trigger = %run.trigger,
                "run started"
            );
            self.events.publish(RunEvent::RunStarted {
                run_id: run.id,
                job_id: run.job_id.clone(),
                trigger: run.trigger,
            });
            self.sender.resume(run.id, ResumeEvent::Start)?;
        } else if let Some(existing) = self.checkpoint.get_run(run.id).await? {
            if existing.status.is_terminal() {
                self.complete(&existing);
            }
        }

        Ok(RunHandle {
            run_id: run.id,
            job_id: run.job_id,
            created,
            rx,
        })
    }

    /// Notify handles waiting on `run`. Called once the run is terminal.
    pub fn complete(&self, run: &RunRecord) {
        let Some(result) = invocation_result(run) else {
            return;
        };
        if let Some((_, tx)) = self.completions.remove(&run.id) {
            tx.send_replace(Some(result));
        }
    }
}

impl std::fmt::Debug for RunLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLauncher")
            .field("awaited_runs", &self.completions.len())
            .finish()
    }
}

/// The `{ok, output | error}` view of a terminal run.
pub fn invocation_result(run: &RunRecord) -> Option<InvocationResult> {
    match run.status {
        RunStatus::Completed => Some(InvocationResult::success(
            run.id,
            run.output.clone().unwrap_or(Value::Null),
        )),
        RunStatus::Failed => Some(InvocationResult::failure(
            run.id,
            run.error
                .clone()
                .unwrap_or_else(|| ErrorInfo::new("Error", "run failed")),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::engine::scheduler::SchedulerCommand;
    use crate::repository::{BoxCheckpointStore, InMemoryCheckpointStore};

    fn launcher() -> (RunLauncher, Arc<CheckpointManager>, tokio::sync::mpsc::UnboundedReceiver<SchedulerCommand>) {
        let (sender, rx) = ResumeSender::channel();
        let checkpoint = Arc::new(CheckpointManager::new(BoxCheckpointStore::new(
            InMemoryCheckpointStore::new(),
        )));
        let timer = Arc::new(TimerService::new(sender.clone()));
        let launcher = RunLauncher::new(Arc::clone(&checkpoint), timer, EventBus::new(16), sender);
        (launcher, checkpoint, rx)
    }

    #[tokio::test]
    async fn launch_persists_and_enqueues_once() {
        let (launcher, checkpoint, mut rx) = launcher();
        let request = LaunchRequest::new("auto-yield-1", "0.0.1", TriggerKind::Event, json!({"id": "x"}));

        let first = launcher.launch(request.clone()).await.unwrap();
        let again = launcher.launch(request.clone()).await.unwrap();
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.run_id, again.run_id);

        let run = checkpoint.require_run(request.id).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(matches!(
            rx.try_recv(),
            Ok(SchedulerCommand::Drive { event: ResumeEvent::Start, .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn handle_observes_completion() {
        let (launcher, checkpoint, _rx) = launcher();
        let request = LaunchRequest::new("child", "1", TriggerKind::Invoke, json!({}));
        let handle = launcher.launch(request.clone()).await.unwrap();

        let mut run = checkpoint.require_run(request.id).await.unwrap();
        run.status = RunStatus::Completed;
        run.output = Some(json!({"message": "Hello"}));
        checkpoint.checkpoint_run(&run).await.unwrap();
        launcher.complete(&run);

        let result = handle.wait_for_completion().await.unwrap();
        assert!(result.ok);
        assert_eq!(result.output, Some(json!({"message": "Hello"})));

        // A late relaunch of a finished run resolves immediately.
        let late = launcher.launch(request).await.unwrap();
        let result = late.wait_for_completion().await.unwrap();
        assert_eq!(result.id, run.id);
    }
}
