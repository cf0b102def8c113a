//! Invocation coordinator: starts child runs on behalf of a parent step and
//! joins their results.
//!
//! Child run IDs are generated and written into the parent's pending step
//! record before any child is launched. Every drive of the parent while the
//! step is pending re-checks each unresolved slot: children that were never
//! persisted are launched, and children that already finished are resolved
//! again. This repairs a crash between writing the step and launching.
//!
//! A child failure never fails the parent; it fills its slot with
//! `ok: false`. The parent resumes once every slot is filled.

use std::sync::Arc;

use serde_json::{Value, json};
use tether_types::event::RunEvent;
use tether_types::invocation::{InvocationResult, InvokeOptions};
use tether_types::run::{ParentLink, RunRecord};
use tether_types::step::{ErrorInfo, StepKind, StepRecord, StepState};
use uuid::Uuid;

use crate::event::EventBus;

use super::callback::{CallbackNotifier, callback_payload};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::clock::TimerService;
use super::executor::ensure_kind;
use super::job::JobError;
use super::launcher::{RunHandle, invocation_result};
use super::scheduler::{ResumeEvent, ResumeSender, SchedulerError};
use super::trigger::{DispatchError, TriggerDispatcher};

/// Outcome of trying to launch one child.
enum ChildLaunch {
    Launched(RunHandle),
    /// The child job refused the request (validation, disabled, wrong trigger).
    Rejected(ErrorInfo),
}

pub struct InvocationCoordinator {
    checkpoint: Arc<CheckpointManager>,
    timer: Arc<TimerService>,
    events: EventBus,
    dispatcher: Arc<TriggerDispatcher>,
    sender: ResumeSender,
    notifier: Option<Arc<dyn CallbackNotifier>>,
    max_batch_size: usize,
}

impl InvocationCoordinator {
    pub fn new(
        checkpoint: Arc<CheckpointManager>,
        timer: Arc<TimerService>,
        events: EventBus,
        dispatcher: Arc<TriggerDispatcher>,
        sender: ResumeSender,
    ) -> Self {
        Self {
            checkpoint,
            timer,
            events,
            dispatcher,
            sender,
            notifier: None,
            max_batch_size: 500,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CallbackNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    // -----------------------------------------------------------------------
    // Parent-side operations
    // -----------------------------------------------------------------------

    /// Fire-and-forget: the step resolves to the child run ID as soon as the
    /// child is persisted and enqueued.
    pub async fn invoke(
        &self,
        parent_run_id: Uuid,
        step_key: &str,
        job_id: &str,
        payload: Value,
        options: InvokeOptions,
    ) -> Result<Uuid, JobError> {
        let step = match self.checkpoint.get_step(parent_run_id, step_key).await? {
            Some(step) => step,
            None => {
                let mut pending =
                    StepRecord::pending(parent_run_id, step_key, StepKind::Invocation, self.timer.now());
                pending.children = vec![Uuid::now_v7()];
                self.checkpoint.record_step(&pending).await?
            }
        };
        ensure_kind(&step, StepKind::Invocation)?;

        match step.state {
            StepState::Completed => return invoked_id(step),
            StepState::Failed => return Err(step_failed(step)),
            StepState::Pending | StepState::Ready => {}
        }

        let child_id = step
            .children
            .first()
            .copied()
            .ok_or_else(|| CheckpointError::Malformed(format!("invocation '{step_key}' has no child id")))?;
        let parent = ParentLink {
            run_id: parent_run_id,
            step_key: step_key.to_string(),
            index: 0,
            wait: false,
        };

        let now = self.timer.now();
        let next = match self
            .launch(child_id, job_id, payload, parent, options.callback_url)
            .await?
        {
            ChildLaunch::Launched(_) => {
                let mut done = step.clone();
                done.state = StepState::Completed;
                done.output = Some(json!({ "id": child_id }));
                done.completed_at = Some(now);
                done
            }
            ChildLaunch::Rejected(error) => {
                let mut failed = step.clone();
                failed.state = StepState::Failed;
                failed.error = Some(error);
                failed.completed_at = Some(now);
                failed
            }
        };
        let stored = self.checkpoint.transition_step(&next, step.state).await?;
        self.publish_completed(&stored);
        match stored.state {
            StepState::Completed => invoked_id(stored),
            StepState::Failed => Err(step_failed(stored)),
            _ => Err(JobError::Suspended),
        }
    }

    /// Invoke one child and suspend until it finishes.
    pub async fn invoke_and_wait(
        &self,
        parent_run_id: Uuid,
        step_key: &str,
        job_id: &str,
        payload: Value,
    ) -> Result<InvocationResult, JobError> {
        self.batch_invoke_and_wait(parent_run_id, step_key, job_id, vec![payload])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| JobError::Serialization(format!("invocation '{step_key}' recorded no result")))
    }

    /// Invoke one child per payload and suspend until all of them finish.
    /// Results come back in payload order.
    pub async fn batch_invoke_and_wait(
        &self,
        parent_run_id: Uuid,
        step_key: &str,
        job_id: &str,
        payloads: Vec<Value>,
    ) -> Result<Vec<InvocationResult>, JobError> {
        let step = match self.checkpoint.get_step(parent_run_id, step_key).await? {
            Some(step) => step,
            None => self.record_batch(parent_run_id, step_key, payloads.len()).await?,
        };
        ensure_kind(&step, StepKind::Invocation)?;

        match step.state {
            StepState::Completed => return joined_results(step),
            StepState::Failed => return Err(step_failed(step)),
            StepState::Pending | StepState::Ready => {}
        }

        // Slots are matched to payloads by position.
        if payloads.len() != step.children.len() {
            return Err(JobError::BatchSizeChanged {
                step_key: step_key.to_string(),
                recorded: step.children.len(),
                given: payloads.len(),
            });
        }

        for (index, (child_id, payload)) in step.children.iter().copied().zip(payloads).enumerate() {
            if step.child_results.get(index).is_some_and(Option::is_some) {
                continue;
            }
            let parent = ParentLink {
                run_id: parent_run_id,
                step_key: step_key.to_string(),
                index,
                wait: true,
            };
            match self.launch(child_id, job_id, payload, parent, None).await? {
                ChildLaunch::Launched(handle) if !handle.created => {
                    // Already persisted by an earlier drive; pick up a result
                    // that may have been produced while nobody was listening.
                    if let Some(result) = self
                        .checkpoint
                        .get_run(child_id)
                        .await?
                        .as_ref()
                        .and_then(invocation_result)
                    {
                        self.checkpoint
                            .resolve_child(parent_run_id, step_key, index, &result)
                            .await?;
                    }
                }
                ChildLaunch::Launched(_) => {}
                ChildLaunch::Rejected(error) => {
                    let result = InvocationResult::failure(child_id, error);
                    self.checkpoint
                        .resolve_child(parent_run_id, step_key, index, &result)
                        .await?;
                }
            }
        }

        let step = self
            .checkpoint
            .get_step(parent_run_id, step_key)
            .await?
            .ok_or_else(|| CheckpointError::StepNotFound {
                run_id: parent_run_id,
                step_key: step_key.to_string(),
            })?;
        if step.state != StepState::Pending || !step.all_children_resolved() {
            return match step.state {
                StepState::Completed => joined_results(step),
                StepState::Failed => Err(step_failed(step)),
                _ => Err(JobError::Suspended),
            };
        }

        let results: Vec<InvocationResult> = step.child_results.iter().flatten().cloned().collect();
        let mut done = step.clone();
        done.state = StepState::Completed;
        done.output = Some(serde_json::to_value(&results).map_err(|e| JobError::Serialization(e.to_string()))?);
        done.completed_at = Some(self.timer.now());
        let stored = self.checkpoint.transition_step(&done, StepState::Pending).await?;
        self.publish_completed(&stored);
        tracing::debug!(
            run_id = %parent_run_id,
            step_key,
            children = results.len(),
            failed = results.iter().filter(|r| !r.ok).count(),
            "invocation joined"
        );
        joined_results(stored)
    }

    /// First recording of a batch step: empty batches resolve immediately,
    /// oversized batches fail, anything else is written as pending with one
    /// pre-generated child ID and an empty result slot per payload.
    async fn record_batch(&self, parent_run_id: Uuid, step_key: &str, count: usize) -> Result<StepRecord, JobError> {
        let now = self.timer.now();
        let record = if count == 0 {
            StepRecord::completed(parent_run_id, step_key, StepKind::Invocation, json!([]), now)
        } else if count > self.max_batch_size {
            StepRecord::failed(
                parent_run_id,
                step_key,
                StepKind::Invocation,
                ErrorInfo::new(
                    "BatchTooLarge",
                    format!("{count} payloads exceed the batch limit of {}", self.max_batch_size),
                ),
                now,
            )
        } else {
            let mut pending = StepRecord::pending(parent_run_id, step_key, StepKind::Invocation, now);
            pending.children = (0..count).map(|_| Uuid::now_v7()).collect();
            pending.child_results = vec![None; count];
            pending
        };
        Ok(self.checkpoint.record_step(&record).await?)
    }

    async fn launch(
        &self,
        child_id: Uuid,
        job_id: &str,
        payload: Value,
        parent: ParentLink,
        callback_url: Option<String>,
    ) -> Result<ChildLaunch, JobError> {
        match self
            .dispatcher
            .launch_child(child_id, job_id, payload, parent, callback_url)
            .await
        {
            Ok(handle) => Ok(ChildLaunch::Launched(handle)),
            Err(DispatchError::UnknownJob(id)) => Err(JobError::UnknownJob(id)),
            Err(DispatchError::Scheduler(SchedulerError::Checkpoint(e))) => Err(JobError::Checkpoint(e)),
            // The engine is stopping. The run stays waiting and recovery
            // relaunches the child from the recorded ID.
            Err(DispatchError::Scheduler(_) | DispatchError::Timer(_)) => Err(JobError::Suspended),
            Err(rejection) => Ok(ChildLaunch::Rejected(ErrorInfo::new(
                rejection.error_name(),
                rejection.to_string(),
            ))),
        }
    }

    fn publish_completed(&self, step: &StepRecord) {
        if step.state == StepState::Completed {
            self.events.publish(RunEvent::StepCompleted {
                run_id: step.run_id,
                step_key: step.step_key.clone(),
                kind: step.kind,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Child-side notification
    // -----------------------------------------------------------------------

    /// Called by the scheduler once a run is terminal: delivers its callback
    /// and, if a parent awaits it, fills the parent's slot. The parent is
    /// resumed when this fills the last slot.
    pub async fn on_run_terminal(&self, run: &RunRecord) {
        if let Some(url) = &run.callback_url {
            self.deliver_callback(url, run);
        }

        let Some(parent) = run.parent.as_ref().filter(|p| p.wait) else {
            return;
        };
        let Some(result) = invocation_result(run) else {
            return;
        };

        match self
            .checkpoint
            .resolve_child(parent.run_id, &parent.step_key, parent.index, &result)
            .await
        {
            Ok(Some(_)) => {
                let event = ResumeEvent::InvocationResolved {
                    step_key: parent.step_key.clone(),
                };
                if let Err(e) = self.sender.resume(parent.run_id, event) {
                    tracing::warn!(parent_run_id = %parent.run_id, error = %e, "failed to resume parent");
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    run_id = %run.id,
                    parent_run_id = %parent.run_id,
                    step_key = %parent.step_key,
                    error = %e,
                    "failed to record child result"
                );
            }
        }
    }

    fn deliver_callback(&self, url: &str, run: &RunRecord) {
        let Some(notifier) = self.notifier.clone() else {
            tracing::debug!(run_id = %run.id, url, "no callback notifier configured");
            return;
        };
        let Some(payload) = callback_payload(run) else {
            return;
        };
        let url = url.to_string();
        let run_id = run.id;
        tokio::spawn(async move {
            match notifier.notify(&url, payload).await {
                Ok(()) => tracing::debug!(run_id = %run_id, url = %url, "callback delivered"),
                Err(e) => tracing::warn!(run_id = %run_id, url = %url, error = %e, "callback delivery failed"),
            }
        });
    }
}

impl std::fmt::Debug for InvocationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationCoordinator")
            .field("max_batch_size", &self.max_batch_size)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

fn invoked_id(step: StepRecord) -> Result<Uuid, JobError> {
    step.output
        .as_ref()
        .and_then(|out| out.get("id"))
        .and_then(Value::as_str)
        .and_then(|id| Uuid::parse_str(id).ok())
        .ok_or_else(|| JobError::Serialization(format!("invocation '{}' has no child id", step.step_key)))
}

fn joined_results(step: StepRecord) -> Result<Vec<InvocationResult>, JobError> {
    serde_json::from_value(step.output.unwrap_or_else(|| json!([])))
        .map_err(|e| JobError::Serialization(e.to_string()))
}

fn step_failed(step: StepRecord) -> JobError {
    JobError::StepFailed {
        step_key: step.step_key,
        error: step
            .error
            .unwrap_or_else(|| ErrorInfo::new("InvocationError", "invocation failed")),
    }
}
