//! The `JobIo` handle a job body uses to run steps.
//!
//! Every primitive is keyed by a caller-supplied step key that must be unique
//! within the run. A primitive that has no recorded outcome yet either
//! resolves in place (tasks, status updates, fire-and-forget invocations) or
//! returns [`JobError::Suspended`], which the body propagates with `?`.
//! Once a drive has suspended, every further step call also returns
//! `Suspended`.
//!
//! Steps of one run execute one at a time. `JobIo` is `Clone`, so a body can
//! join several step futures; they take turns on the drive's step lock in
//! the order they are first polled.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tether_types::invocation::{InvocationResult, InvokeOptions};
use tether_types::retry::{BackgroundCallOptions, RetryPolicy};
use tether_types::status::{StatusRecord, StatusUpdate};
use tether_types::step::StepKind;
use uuid::Uuid;

use super::checkpoint::CheckpointManager;
use super::clock::TimerService;
use super::executor::TaskExecutor;
use super::invocation::InvocationCoordinator;
use super::job::{JobDefinition, JobError};
use super::status::StatusChannel;

// ---------------------------------------------------------------------------
// RunServices
// ---------------------------------------------------------------------------

/// Engine components shared by every drive.
pub(crate) struct RunServices {
    pub checkpoint: Arc<CheckpointManager>,
    pub timer: Arc<TimerService>,
    pub executor: TaskExecutor,
    pub invocations: Arc<InvocationCoordinator>,
    pub statuses: Arc<StatusChannel>,
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DriveState {
    seen: HashSet<String>,
    resolved: u32,
    waiting_on: Option<String>,
    suspended: bool,
}

/// Per-drive bookkeeping: which step keys the body produced, how many
/// resolved, and where it suspended.
pub(crate) struct RunContext {
    run_id: Uuid,
    job_id: String,
    /// Steps already recorded when the drive began.
    recorded_at_start: usize,
    state: Mutex<DriveState>,
    /// Held for the whole of each step.
    step_lock: tokio::sync::Mutex<()>,
}

impl RunContext {
    pub(crate) fn new(run_id: Uuid, job_id: impl Into<String>, recorded_at_start: usize) -> Self {
        Self {
            run_id,
            job_id: job_id.into(),
            recorded_at_start,
            state: Mutex::new(DriveState::default()),
            step_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, DriveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self, step_key: &str) -> Result<(), JobError> {
        let mut state = self.state();
        if state.suspended {
            return Err(JobError::Suspended);
        }
        if !state.seen.insert(step_key.to_string()) {
            return Err(JobError::DuplicateStepKey(step_key.to_string()));
        }
        Ok(())
    }

    fn finish<T>(&self, step_key: &str, result: &Result<T, JobError>) {
        let mut state = self.state();
        match result {
            Err(JobError::Suspended) => {
                if !state.suspended {
                    state.suspended = true;
                    state.waiting_on = Some(step_key.to_string());
                }
            }
            Err(JobError::Checkpoint(_)) => {}
            _ => state.resolved += 1,
        }
    }

    /// Whether the body is still re-walking steps recorded before this drive.
    pub(crate) fn is_replaying(&self) -> bool {
        self.state().seen.len() < self.recorded_at_start
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.state().suspended
    }

    pub(crate) fn resolved(&self) -> u32 {
        self.state().resolved
    }

    pub(crate) fn waiting_on(&self) -> Option<String> {
        self.state().waiting_on.clone()
    }
}

// ---------------------------------------------------------------------------
// RunLogger
// ---------------------------------------------------------------------------

/// Run-scoped logger. Silent while the body replays recorded steps, so each
/// line is emitted once per run rather than once per drive.
#[derive(Clone)]
pub struct RunLogger {
    ctx: Arc<RunContext>,
}

impl RunLogger {
    pub fn debug(&self, message: &str) {
        if !self.ctx.is_replaying() {
            tracing::debug!(run_id = %self.ctx.run_id, job_id = %self.ctx.job_id, "{message}");
        }
    }

    pub fn info(&self, message: &str) {
        if !self.ctx.is_replaying() {
            tracing::info!(run_id = %self.ctx.run_id, job_id = %self.ctx.job_id, "{message}");
        }
    }

    pub fn warn(&self, message: &str) {
        if !self.ctx.is_replaying() {
            tracing::warn!(run_id = %self.ctx.run_id, job_id = %self.ctx.job_id, "{message}");
        }
    }

    pub fn error(&self, message: &str) {
        if !self.ctx.is_replaying() {
            tracing::error!(run_id = %self.ctx.run_id, job_id = %self.ctx.job_id, "{message}");
        }
    }
}

// ---------------------------------------------------------------------------
// JobIo
// ---------------------------------------------------------------------------

/// Step primitives available to a job body for one drive of one run.
#[derive(Clone)]
pub struct JobIo {
    ctx: Arc<RunContext>,
    services: Arc<RunServices>,
    job: Arc<JobDefinition>,
}

impl JobIo {
    pub(crate) fn new(ctx: Arc<RunContext>, services: Arc<RunServices>, job: Arc<JobDefinition>) -> Self {
        Self { ctx, services, job }
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    pub fn job_id(&self) -> &str {
        &self.job.id
    }

    pub fn logger(&self) -> RunLogger {
        RunLogger {
            ctx: Arc::clone(&self.ctx),
        }
    }

    async fn step<T>(
        &self,
        step_key: &str,
        fut: impl Future<Output = Result<T, JobError>>,
    ) -> Result<T, JobError> {
        let _turn = self.ctx.step_lock.lock().await;
        self.ctx.begin(step_key)?;
        let result = fut.await;
        self.ctx.finish(step_key, &result);
        result
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Run `work` once and record its result under `step_key`.
    pub async fn run_task<T, F, Fut>(&self, step_key: &str, work: F) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.task(step_key, None, work).await
    }

    /// Like [`run_task`](Self::run_task), retrying failed tries with
    /// exponential backoff. Only the final failure is recorded.
    pub async fn run_task_with_retry<T, F, Fut>(
        &self,
        step_key: &str,
        policy: RetryPolicy,
        work: F,
    ) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.task(step_key, Some(&policy), work).await
    }

    async fn task<T, F, Fut>(
        &self,
        step_key: &str,
        policy: Option<&RetryPolicy>,
        work: F,
    ) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let value = self
            .step(
                step_key,
                self.services.executor.execute(
                    self.ctx.run_id,
                    step_key,
                    StepKind::Task,
                    policy,
                    move || async move {
                        let output = work().await?;
                        Ok::<Value, anyhow::Error>(serde_json::to_value(output)?)
                    },
                ),
            )
            .await?;
        decode(value)
    }

    /// Suspend the run for `delay`.
    pub async fn wait(&self, step_key: &str, delay: Duration) -> Result<(), JobError> {
        self.step(
            step_key,
            self.services.executor.wait(self.ctx.run_id, step_key, delay),
        )
        .await
    }

    /// A random number in `[0, 1)`, recorded so replays see the same value.
    pub async fn random(&self, step_key: &str) -> Result<f64, JobError> {
        let value = self
            .step(
                step_key,
                self.services.executor.execute(
                    self.ctx.run_id,
                    step_key,
                    StepKind::Random,
                    None,
                    || async { Ok::<Value, anyhow::Error>(json!(random_unit())) },
                ),
            )
            .await?;
        decode(value)
    }

    /// Call an integration injected into this job. The whole call, including
    /// retries, fails once `options.timeout.duration_in_ms` has elapsed.
    pub async fn background_call(
        &self,
        step_key: &str,
        integration_id: &str,
        operation: &str,
        request: Value,
        options: BackgroundCallOptions,
    ) -> Result<Value, JobError> {
        let policy = options.policy();
        let integration = self.job.integrations.get(integration_id);
        let operation = operation.to_string();
        self.step(step_key, async {
            let integration =
                integration.ok_or_else(|| JobError::UnknownIntegration(integration_id.to_string()))?;
            self.services
                .executor
                .execute(
                    self.ctx.run_id,
                    step_key,
                    StepKind::BackgroundCall,
                    Some(&policy),
                    move || async move {
                        Ok::<Value, anyhow::Error>(integration.call(&operation, request).await?)
                    },
                )
                .await
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Invocations
    // -----------------------------------------------------------------------

    /// Start a run of `job_id` without waiting for it. Returns the child run ID.
    pub async fn invoke(
        &self,
        step_key: &str,
        job_id: &str,
        payload: Value,
        options: InvokeOptions,
    ) -> Result<Uuid, JobError> {
        self.step(
            step_key,
            self.services
                .invocations
                .invoke(self.ctx.run_id, step_key, job_id, payload, options),
        )
        .await
    }

    /// Start a run of `job_id` and suspend until it finishes. A child failure
    /// is reported as `ok: false`, not as an error.
    pub async fn invoke_and_wait_for_completion(
        &self,
        step_key: &str,
        job_id: &str,
        payload: Value,
    ) -> Result<InvocationResult, JobError> {
        self.step(
            step_key,
            self.services
                .invocations
                .invoke_and_wait(self.ctx.run_id, step_key, job_id, payload),
        )
        .await
    }

    /// Start one run of `job_id` per payload and suspend until all finish.
    /// Results are in payload order.
    pub async fn batch_invoke_and_wait_for_completion(
        &self,
        step_key: &str,
        job_id: &str,
        payloads: Vec<Value>,
    ) -> Result<Vec<InvocationResult>, JobError> {
        self.step(
            step_key,
            self.services
                .invocations
                .batch_invoke_and_wait(self.ctx.run_id, step_key, job_id, payloads),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Statuses
    // -----------------------------------------------------------------------

    /// Create the status `key` (also the step key) with its initial fields.
    /// The label is required on creation.
    pub async fn create_status(&self, key: &str, initial: StatusUpdate) -> Result<StatusHandle, JobError> {
        if initial.label.is_none() {
            return Err(JobError::MissingStatusLabel(key.to_string()));
        }
        self.update_status(key, key, initial).await?;
        Ok(StatusHandle {
            key: key.to_string(),
            io: self.clone(),
        })
    }

    async fn update_status(
        &self,
        step_key: &str,
        key: &str,
        update: StatusUpdate,
    ) -> Result<StatusRecord, JobError> {
        self.step(
            step_key,
            self.services
                .statuses
                .apply(self.ctx.run_id, step_key, key, &update),
        )
        .await
    }
}

impl std::fmt::Debug for JobIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobIo")
            .field("run_id", &self.ctx.run_id)
            .field("job_id", &self.job.id)
            .finish()
    }
}

/// Handle to a status created by a job body.
#[derive(Clone, Debug)]
pub struct StatusHandle {
    key: String,
    io: JobIo,
}

impl StatusHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Overwrite the provided fields, recorded as step `step_key`.
    pub async fn update(&self, step_key: &str, update: StatusUpdate) -> Result<StatusRecord, JobError> {
        self.io.update_status(step_key, &self.key, update).await
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, JobError> {
    serde_json::from_value(value).map_err(|e| JobError::Serialization(e.to_string()))
}

/// Uniform value in `[0, 1)` from the random bits of a v7 UUID.
fn random_unit() -> f64 {
    const MANTISSA_BITS: u32 = 52;
    let bits = (Uuid::now_v7().as_u128() as u64) & ((1u64 << MANTISSA_BITS) - 1);
    bits as f64 / (1u64 << MANTISSA_BITS) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_rejects_duplicate_keys() {
        let ctx = RunContext::new(Uuid::now_v7(), "job", 0);
        ctx.begin("a").unwrap();
        ctx.finish::<()>("a", &Ok(()));
        assert!(matches!(ctx.begin("a"), Err(JobError::DuplicateStepKey(key)) if key == "a"));
        assert_eq!(ctx.resolved(), 1);
    }

    #[test]
    fn context_stays_suspended() {
        let ctx = RunContext::new(Uuid::now_v7(), "job", 0);
        ctx.begin("wait-1").unwrap();
        ctx.finish::<()>("wait-1", &Err(JobError::Suspended));
        assert!(ctx.is_suspended());
        assert_eq!(ctx.waiting_on().as_deref(), Some("wait-1"));
        assert!(matches!(ctx.begin("task-2"), Err(JobError::Suspended)));
        assert_eq!(ctx.resolved(), 0);
    }

    #[test]
    fn replay_window_covers_recorded_steps() {
        let ctx = RunContext::new(Uuid::now_v7(), "job", 2);
        assert!(ctx.is_replaying());
        ctx.begin("task-1").unwrap();
        assert!(ctx.is_replaying());
        ctx.begin("wait-1").unwrap();
        assert!(!ctx.is_replaying());
    }

    #[test]
    fn random_unit_is_in_range() {
        for _ in 0..100 {
            let x = random_unit();
            assert!((0.0..1.0).contains(&x));
        }
    }
}
