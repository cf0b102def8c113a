//! BoxCheckpointStore -- object-safe dynamic dispatch wrapper for CheckpointStore.
//!
//! 1. Define an object-safe `CheckpointStoreDyn` trait with boxed futures
//! 2. Blanket-impl `CheckpointStoreDyn` for all `T: CheckpointStore`
//! 3. `BoxCheckpointStore` wraps `Box<dyn CheckpointStoreDyn>` and delegates

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use tether_types::error::RepositoryError;
use tether_types::invocation::InvocationResult;
use tether_types::run::{RunRecord, RunStatus};
use tether_types::status::{StatusRecord, StatusUpdate};
use tether_types::step::{StepRecord, StepState};
use uuid::Uuid;

use super::checkpoint::CheckpointStore;

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepositoryError>> + Send + 'a>>;

/// Object-safe version of [`CheckpointStore`] with boxed futures.
///
/// A blanket implementation is provided for all types implementing
/// `CheckpointStore`.
pub trait CheckpointStoreDyn: Send + Sync {
    fn create_run_boxed<'a>(&'a self, run: &'a RunRecord) -> BoxFut<'a, bool>;
    fn get_run_boxed<'a>(&'a self, run_id: &'a Uuid) -> BoxFut<'a, Option<RunRecord>>;
    fn update_run_boxed<'a>(&'a self, run: &'a RunRecord) -> BoxFut<'a, ()>;
    fn list_runs_boxed(&self, status: Option<RunStatus>, limit: u32) -> BoxFut<'_, Vec<RunRecord>>;
    fn list_unfinished_runs_boxed(&self) -> BoxFut<'_, Vec<RunRecord>>;
    fn list_child_runs_boxed<'a>(&'a self, parent_id: &'a Uuid) -> BoxFut<'a, Vec<RunRecord>>;
    fn get_step_boxed<'a>(
        &'a self,
        run_id: &'a Uuid,
        step_key: &'a str,
    ) -> BoxFut<'a, Option<StepRecord>>;
    fn list_steps_boxed<'a>(&'a self, run_id: &'a Uuid) -> BoxFut<'a, Vec<StepRecord>>;
    fn insert_step_boxed<'a>(&'a self, step: &'a StepRecord) -> BoxFut<'a, StepRecord>;
    fn update_step_boxed<'a>(
        &'a self,
        step: &'a StepRecord,
        expected: StepState,
    ) -> BoxFut<'a, StepRecord>;
    fn resolve_child_boxed<'a>(
        &'a self,
        run_id: &'a Uuid,
        step_key: &'a str,
        index: usize,
        result: &'a InvocationResult,
    ) -> BoxFut<'a, Option<StepRecord>>;
    fn apply_status_boxed<'a>(
        &'a self,
        run_id: &'a Uuid,
        key: &'a str,
        update: &'a StatusUpdate,
        now: DateTime<Utc>,
    ) -> BoxFut<'a, StatusRecord>;
    fn get_status_boxed<'a>(
        &'a self,
        run_id: &'a Uuid,
        key: &'a str,
    ) -> BoxFut<'a, Option<StatusRecord>>;
    fn list_statuses_boxed<'a>(&'a self, run_id: &'a Uuid) -> BoxFut<'a, Vec<StatusRecord>>;
}

/// Blanket implementation: any `CheckpointStore` automatically implements `CheckpointStoreDyn`.
impl<T: CheckpointStore> CheckpointStoreDyn for T {
    fn create_run_boxed<'a>(&'a self, run: &'a RunRecord) -> BoxFut<'a, bool> {
        Box::pin(self.create_run(run))
    }

    fn get_run_boxed<'a>(&'a self, run_id: &'a Uuid) -> BoxFut<'a, Option<RunRecord>> {
        Box::pin(self.get_run(run_id))
    }

    fn update_run_boxed<'a>(&'a self, run: &'a RunRecord) -> BoxFut<'a, ()> {
        Box::pin(self.update_run(run))
    }

    fn list_runs_boxed(&self, status: Option<RunStatus>, limit: u32) -> BoxFut<'_, Vec<RunRecord>> {
        Box::pin(self.list_runs(status, limit))
    }

    fn list_unfinished_runs_boxed(&self) -> BoxFut<'_, Vec<RunRecord>> {
        Box::pin(self.list_unfinished_runs())
    }

    fn list_child_runs_boxed<'a>(&'a self, parent_id: &'a Uuid) -> BoxFut<'a, Vec<RunRecord>> {
        Box::pin(self.list_child_runs(parent_id))
    }

    fn get_step_boxed<'a>(
        &'a self,
        run_id: &'a Uuid,
        step_key: &'a str,
    ) -> BoxFut<'a, Option<StepRecord>> {
        Box::pin(self.get_step(run_id, step_key))
    }

    fn list_steps_boxed<'a>(&'a self, run_id: &'a Uuid) -> BoxFut<'a, Vec<StepRecord>> {
        Box::pin(self.list_steps(run_id))
    }

    fn insert_step_boxed<'a>(&'a self, step: &'a StepRecord) -> BoxFut<'a, StepRecord> {
        Box::pin(self.insert_step(step))
    }

    fn update_step_boxed<'a>(
        &'a self,
        step: &'a StepRecord,
        expected: StepState,
    ) -> BoxFut<'a, StepRecord> {
        Box::pin(self.update_step(step, expected))
    }

    fn resolve_child_boxed<'a>(
        &'a self,
        run_id: &'a Uuid,
        step_key: &'a str,
        index: usize,
        result: &'a InvocationResult,
    ) -> BoxFut<'a, Option<StepRecord>> {
        Box::pin(self.resolve_child(run_id, step_key, index, result))
    }

    fn apply_status_boxed<'a>(
        &'a self,
        run_id: &'a Uuid,
        key: &'a str,
        update: &'a StatusUpdate,
        now: DateTime<Utc>,
    ) -> BoxFut<'a, StatusRecord> {
        Box::pin(self.apply_status(run_id, key, update, now))
    }

    fn get_status_boxed<'a>(
        &'a self,
        run_id: &'a Uuid,
        key: &'a str,
    ) -> BoxFut<'a, Option<StatusRecord>> {
        Box::pin(self.get_status(run_id, key))
    }

    fn list_statuses_boxed<'a>(&'a self, run_id: &'a Uuid) -> BoxFut<'a, Vec<StatusRecord>> {
        Box::pin(self.list_statuses(run_id))
    }
}

/// Type-erased checkpoint store for runtime backend selection.
///
/// Since `CheckpointStore` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxCheckpointStore` provides equivalent methods that delegate
/// to the inner `CheckpointStoreDyn` trait object.
pub struct BoxCheckpointStore {
    inner: Box<dyn CheckpointStoreDyn + Send + Sync>,
}

impl BoxCheckpointStore {
    /// Wrap a concrete `CheckpointStore` in a type-erased box.
    pub fn new<T: CheckpointStore + 'static>(store: T) -> Self {
        Self {
            inner: Box::new(store),
        }
    }

    pub async fn create_run(&self, run: &RunRecord) -> Result<bool, RepositoryError> {
        self.inner.create_run_boxed(run).await
    }

    pub async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        self.inner.get_run_boxed(run_id).await
    }

    pub async fn update_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        self.inner.update_run_boxed(run).await
    }

    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        self.inner.list_runs_boxed(status, limit).await
    }

    pub async fn list_unfinished_runs(&self) -> Result<Vec<RunRecord>, RepositoryError> {
        self.inner.list_unfinished_runs_boxed().await
    }

    pub async fn list_child_runs(&self, parent_id: &Uuid) -> Result<Vec<RunRecord>, RepositoryError> {
        self.inner.list_child_runs_boxed(parent_id).await
    }

    pub async fn get_step(
        &self,
        run_id: &Uuid,
        step_key: &str,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        self.inner.get_step_boxed(run_id, step_key).await
    }

    pub async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        self.inner.list_steps_boxed(run_id).await
    }

    pub async fn insert_step(&self, step: &StepRecord) -> Result<StepRecord, RepositoryError> {
        self.inner.insert_step_boxed(step).await
    }

    pub async fn update_step(
        &self,
        step: &StepRecord,
        expected: StepState,
    ) -> Result<StepRecord, RepositoryError> {
        self.inner.update_step_boxed(step, expected).await
    }

    pub async fn resolve_child(
        &self,
        run_id: &Uuid,
        step_key: &str,
        index: usize,
        result: &InvocationResult,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        self.inner
            .resolve_child_boxed(run_id, step_key, index, result)
            .await
    }

    pub async fn apply_status(
        &self,
        run_id: &Uuid,
        key: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusRecord, RepositoryError> {
        self.inner.apply_status_boxed(run_id, key, update, now).await
    }

    pub async fn get_status(
        &self,
        run_id: &Uuid,
        key: &str,
    ) -> Result<Option<StatusRecord>, RepositoryError> {
        self.inner.get_status_boxed(run_id, key).await
    }

    pub async fn list_statuses(&self, run_id: &Uuid) -> Result<Vec<StatusRecord>, RepositoryError> {
        self.inner.list_statuses_boxed(run_id).await
    }
}

impl std::fmt::Debug for BoxCheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCheckpointStore").finish_non_exhaustive()
    }
}
