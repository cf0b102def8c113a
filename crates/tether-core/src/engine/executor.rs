//! Task executor: runs one step's work and records its outcome.
//!
//! Given `(run_id, step_key)`, a recorded outcome is returned without calling
//! the work again. Otherwise the work runs once for this drive:
//!
//! 1. success is checkpointed as `Completed` and returned
//! 2. failure with retries left is checkpointed as `Pending` with the attempt
//!    count, wake time and deadline; a wake is scheduled and the run suspends
//! 3. final failure (or the overall deadline passing) is checkpointed as
//!    `Failed` and returned as [`JobError::StepFailed`]
//!
//! A crash after the work ran but before its outcome was written re-runs the
//! work on recovery. Work with external side effects must be idempotent or
//! keyed uniquely.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tether_types::event::RunEvent;
use tether_types::retry::RetryPolicy;
use tether_types::step::{ErrorInfo, StepKind, StepRecord, StepState};
use uuid::Uuid;

use crate::event::EventBus;

use super::checkpoint::CheckpointManager;
use super::clock::TimerService;
use super::job::JobError;
use super::retry::{RetryDecision, RetryHandler};

/// Outcome of a single try of a step's work.
enum TryOutcome {
    Success(Value),
    Failure(ErrorInfo),
    TimedOut,
}

/// Runs step work under the checkpoint discipline.
#[derive(Clone)]
pub struct TaskExecutor {
    checkpoint: Arc<CheckpointManager>,
    timer: Arc<TimerService>,
    events: EventBus,
}

impl TaskExecutor {
    pub fn new(checkpoint: Arc<CheckpointManager>, timer: Arc<TimerService>, events: EventBus) -> Self {
        Self {
            checkpoint,
            timer,
            events,
        }
    }

    /// Execute `work` for `(run_id, step_key)` at most once per drive.
    ///
    /// `work` is only called when the step has no outcome yet, or when a
    /// retry became due.
    pub async fn execute<F, Fut>(
        &self,
        run_id: Uuid,
        step_key: &str,
        kind: StepKind,
        policy: Option<&RetryPolicy>,
        work: F,
    ) -> Result<Value, JobError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>>,
    {
        let previous = match self.checkpoint.get_step(run_id, step_key).await? {
            Some(step) => {
                ensure_kind(&step, kind)?;
                if step.state != StepState::Ready {
                    return self.settle(step);
                }
                Some(step)
            }
            None => None,
        };

        let started = self.timer.now();
        let (attempt, deadline) = match &previous {
            Some(step) => (step.attempt, step.deadline),
            None => (0, RetryHandler::deadline(policy, started)),
        };
        let tries = attempt + 1;

        let outcome = match RetryHandler::remaining(deadline, started) {
            Some(remaining) if remaining.is_zero() => TryOutcome::TimedOut,
            Some(remaining) => match tokio::time::timeout(remaining, work()).await {
                Ok(result) => TryOutcome::from(result),
                Err(_) => TryOutcome::TimedOut,
            },
            None => TryOutcome::from(work().await),
        };

        let now = self.timer.now();
        let (mut next, will_retry) = match outcome {
            TryOutcome::Success(value) => (StepRecord::completed(run_id, step_key, kind, value, now), false),
            TryOutcome::TimedOut => (
                StepRecord::failed(run_id, step_key, kind, RetryHandler::timeout_error(policy), now),
                false,
            ),
            TryOutcome::Failure(error) => match RetryHandler::decide(policy, tries, now, deadline) {
                RetryDecision::RetryAt { wake_at } => {
                    let mut pending = StepRecord::pending(run_id, step_key, kind, now);
                    pending.wake_at = Some(wake_at);
                    pending.error = Some(error);
                    (pending, true)
                }
                RetryDecision::GiveUp => (StepRecord::failed(run_id, step_key, kind, error, now), false),
            },
        };
        next.attempt = tries;
        next.deadline = deadline;

        let stored = match &previous {
            Some(prev) => self.checkpoint.transition_step(&next, prev.state).await?,
            None => self.checkpoint.record_step(&next).await?,
        };
        if stored.state == next.state && stored.attempt == next.attempt {
            self.publish_outcome(&stored, will_retry);
        }
        self.settle(stored)
    }

    /// Suspend the run until `delay` has elapsed since the wait was first
    /// recorded.
    pub async fn wait(&self, run_id: Uuid, step_key: &str, delay: Duration) -> Result<(), JobError> {
        if let Some(step) = self.checkpoint.get_step(run_id, step_key).await? {
            ensure_kind(&step, StepKind::Wait)?;
            return self.settle(step).map(|_| ());
        }

        let now = self.timer.now();
        let mut pending = StepRecord::pending(run_id, step_key, StepKind::Wait, now);
        pending.wake_at = Some(
            chrono::Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(now),
        );
        let stored = self.checkpoint.record_step(&pending).await?;
        self.settle(stored).map(|_| ())
    }

    /// Turn a stored record into the value the job body sees.
    ///
    /// Pending timed steps re-arm their wake so a replay after restart picks
    /// the timer back up; duplicate wakes are ignored by the checkpoint.
    fn settle(&self, step: StepRecord) -> Result<Value, JobError> {
        match step.state {
            StepState::Completed => Ok(step.output.unwrap_or(Value::Null)),
            StepState::Failed => Err(JobError::StepFailed {
                step_key: step.step_key,
                error: step
                    .error
                    .unwrap_or_else(|| ErrorInfo::new("TaskError", "step failed")),
            }),
            StepState::Pending => {
                if let Some(at) = step.wake_at {
                    self.timer.schedule_wake_at(step.run_id, &step.step_key, at);
                }
                Err(JobError::Suspended)
            }
            StepState::Ready => {
                self.timer.schedule_wake(step.run_id, &step.step_key, Duration::ZERO);
                Err(JobError::Suspended)
            }
        }
    }

    fn publish_outcome(&self, step: &StepRecord, will_retry: bool) {
        match step.state {
            StepState::Completed => self.events.publish(RunEvent::StepCompleted {
                run_id: step.run_id,
                step_key: step.step_key.clone(),
                kind: step.kind,
            }),
            StepState::Failed | StepState::Pending => {
                if let Some(error) = &step.error {
                    tracing::debug!(
                        run_id = %step.run_id,
                        step_key = %step.step_key,
                        attempt = step.attempt,
                        will_retry,
                        error = %error,
                        "step try failed"
                    );
                    self.events.publish(RunEvent::StepFailed {
                        run_id: step.run_id,
                        step_key: step.step_key.clone(),
                        error: error.clone(),
                        will_retry,
                    });
                }
            }
            StepState::Ready => {}
        }
    }
}

impl From<anyhow::Result<Value>> for TryOutcome {
    fn from(result: anyhow::Result<Value>) -> Self {
        match result {
            Ok(value) => TryOutcome::Success(value),
            Err(e) => TryOutcome::Failure(ErrorInfo::new("TaskError", format!("{e:#}"))),
        }
    }
}

/// Reject replaying a step key recorded for a different kind of step.
pub(crate) fn ensure_kind(step: &StepRecord, kind: StepKind) -> Result<(), JobError> {
    if step.kind == kind {
        Ok(())
    } else {
        Err(JobError::StepKindMismatch {
            step_key: step.step_key.clone(),
            recorded: step.kind.as_str(),
            requested: kind.as_str(),
        })
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::Instant;

    use crate::engine::scheduler::{ResumeEvent, ResumeSender, SchedulerCommand};
    use crate::repository::{BoxCheckpointStore, InMemoryCheckpointStore};

    struct Harness {
        checkpoint: Arc<CheckpointManager>,
        timer: Arc<TimerService>,
        executor: TaskExecutor,
        rx: UnboundedReceiver<SchedulerCommand>,
    }

    fn harness() -> Harness {
        let (sender, rx) = ResumeSender::channel();
        let checkpoint = Arc::new(CheckpointManager::new(BoxCheckpointStore::new(
            InMemoryCheckpointStore::new(),
        )));
        let timer = Arc::new(TimerService::new(sender));
        let executor = TaskExecutor::new(Arc::clone(&checkpoint), Arc::clone(&timer), EventBus::new(16));
        Harness {
            checkpoint,
            timer,
            executor,
            rx,
        }
    }

    /// Wait for the next wake and apply it the way the scheduler does.
    async fn deliver_wake(h: &mut Harness, run_id: Uuid) {
        match h.rx.recv().await {
            Some(SchedulerCommand::Drive {
                run_id: id,
                event: ResumeEvent::TimerFired { step_key },
            }) => {
                assert_eq!(id, run_id);
                h.checkpoint.fire_timer(run_id, &step_key, h.timer.now()).await.unwrap();
            }
            other => panic!("expected a wake, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn recorded_step_is_not_executed_again() {
        let h = harness();
        let run_id = Uuid::now_v7();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = h
                .executor
                .execute(run_id, "task-1", StepKind::Task, None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"n": 1}))
                })
                .await
                .unwrap();
            assert_eq!(value, json!({"n": 1}));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_without_policy_is_recorded_and_replayed() {
        let h = harness();
        let run_id = Uuid::now_v7();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let err = h
                .executor
                .execute(run_id, "task-2", StepKind::Task, None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(anyhow::anyhow!("Forced error"))
                })
                .await
                .unwrap_err();
            match err {
                JobError::StepFailed { step_key, error } => {
                    assert_eq!(step_key, "task-2");
                    assert_eq!(error, ErrorInfo::new("TaskError", "Forced error"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_spaces_tries_by_backoff() {
        let mut h = harness();
        let run_id = Uuid::now_v7();
        let policy = RetryPolicy::new(3, 1000, 2.0);
        let mut tried_at: Vec<Instant> = Vec::new();

        loop {
            let result = h
                .executor
                .execute(run_id, "flaky", StepKind::Task, Some(&policy), || {
                    tried_at.push(Instant::now());
                    async { Err::<Value, _>(anyhow::anyhow!("always fails")) }
                })
                .await;
            match result {
                Err(JobError::Suspended) => deliver_wake(&mut h, run_id).await,
                Err(JobError::StepFailed { error, .. }) => {
                    assert_eq!(error.name, "TaskError");
                    break;
                }
                other => panic!("unexpected result: {other:?}"),
            }
        }

        assert_eq!(tried_at.len(), 4);
        let gaps: Vec<u128> = tried_at
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis())
            .collect();
        assert!(gaps[0] >= 1000, "gaps: {gaps:?}");
        assert!(gaps[1] >= 2000, "gaps: {gaps:?}");
        assert!(gaps[2] >= 4000, "gaps: {gaps:?}");

        let stored = h.checkpoint.get_step(run_id, "flaky").await.unwrap().unwrap();
        assert_eq!(stored.state, StepState::Failed);
        assert_eq!(stored.attempt, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_later_try() {
        let mut h = harness();
        let run_id = Uuid::now_v7();
        let policy = RetryPolicy::new(3, 500, 2.0);
        let calls = AtomicUsize::new(0);

        let value = loop {
            let result = h
                .executor
                .execute(run_id, "eventually", StepKind::Task, Some(&policy), || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(anyhow::anyhow!("not yet"))
                    } else {
                        Ok(json!("done"))
                    }
                })
                .await;
            match result {
                Err(JobError::Suspended) => deliver_wake(&mut h, run_id).await,
                other => break other.unwrap(),
            }
        };
        assert_eq!(value, json!("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn overall_timeout_fails_regardless_of_retries() {
        let h = harness();
        let run_id = Uuid::now_v7();
        let policy = RetryPolicy::new(10, 1000, 2.0).with_timeout(1500);

        let err = h
            .executor
            .execute(run_id, "slow", StepKind::BackgroundCall, Some(&policy), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!("late"))
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {err:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_suspends_until_timer_fires() {
        let mut h = harness();
        let run_id = Uuid::now_v7();
        let started = Instant::now();

        let first = h.executor.wait(run_id, "wait-1", Duration::from_secs(5)).await;
        assert!(matches!(first, Err(JobError::Suspended)));

        deliver_wake(&mut h, run_id).await;
        assert!(started.elapsed() >= Duration::from_secs(5));
        h.executor
            .wait(run_id, "wait-1", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn kind_mismatch_is_rejected() {
        let h = harness();
        let run_id = Uuid::now_v7();
        h.executor
            .execute(run_id, "step", StepKind::Task, None, || async { Ok(json!(1)) })
            .await
            .unwrap();
        let err = h
            .executor
            .wait(run_id, "step", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::StepKindMismatch { .. }));
    }
}
