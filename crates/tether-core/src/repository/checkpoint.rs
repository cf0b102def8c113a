//! Checkpoint store trait definition.
//!
//! Defines the durable storage interface for runs, step checkpoints and
//! status records. The infrastructure layer (tether-infra) implements this
//! trait with SQLite persistence; [`super::memory`] provides an in-memory
//! implementation.

use chrono::{DateTime, Utc};
use tether_types::error::RepositoryError;
use tether_types::invocation::InvocationResult;
use tether_types::run::{RunRecord, RunStatus};
use tether_types::status::{StatusRecord, StatusUpdate};
use tether_types::step::{StepRecord, StepState};
use uuid::Uuid;

/// Repository trait for run checkpoints.
///
/// Covers three entity families:
/// - **Runs:** create/update/query execution instances.
/// - **Steps:** insert-if-absent and compare-and-set on step records, plus
///   atomic child-slot resolution for invocation steps.
/// - **Statuses:** atomic merge of status updates with version bump.
///
/// Every check-then-write operation is atomic per `(run_id, step_key)`.
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run unless one with the same ID exists. Returns `true` if
    /// the run was created.
    fn create_run(
        &self,
        run: &RunRecord,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Get a run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<RunRecord>, RepositoryError>> + Send;

    /// Replace a run's mutable fields (status, cursor, output, error, timestamps).
    ///
    /// Returns `RepositoryError::NotFound` if the run does not exist.
    fn update_run(
        &self,
        run: &RunRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List runs, newest first, optionally filtered by status.
    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    /// List runs that have not reached a terminal state, oldest first.
    fn list_unfinished_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    /// List runs started by invocation steps of `parent_id`, oldest first.
    fn list_child_runs(
        &self,
        parent_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<RunRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    /// Get one step checkpoint.
    fn get_step(
        &self,
        run_id: &Uuid,
        step_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    /// List a run's steps in the order they were first recorded.
    fn list_steps(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRecord>, RepositoryError>> + Send;

    /// Insert a step unless the key is already recorded for the run.
    ///
    /// Returns the stored record: the new one (with its assigned `seq`) or
    /// the one that was already there.
    fn insert_step(
        &self,
        step: &StepRecord,
    ) -> impl std::future::Future<Output = Result<StepRecord, RepositoryError>> + Send;

    /// Replace a step if its stored state equals `expected`.
    ///
    /// Returns the stored record after the call; when the state did not
    /// match, that is the unchanged record. `seq` and `created_at` are kept.
    fn update_step(
        &self,
        step: &StepRecord,
        expected: StepState,
    ) -> impl std::future::Future<Output = Result<StepRecord, RepositoryError>> + Send;

    /// Fill child slot `index` of a pending invocation step.
    ///
    /// A slot that is already filled is left alone. Returns the record only
    /// when this call filled the last empty slot, so exactly one caller
    /// observes the join completing.
    fn resolve_child(
        &self,
        run_id: &Uuid,
        step_key: &str,
        index: usize,
        result: &InvocationResult,
    ) -> impl std::future::Future<Output = Result<Option<StepRecord>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Statuses
    // -----------------------------------------------------------------------

    /// Merge an update into a status record (creating it if needed) and
    /// bump its version. Returns the new record.
    fn apply_status(
        &self,
        run_id: &Uuid,
        key: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<StatusRecord, RepositoryError>> + Send;

    /// Get one status record.
    fn get_status(
        &self,
        run_id: &Uuid,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<StatusRecord>, RepositoryError>> + Send;

    /// List a run's status records ordered by key.
    fn list_statuses(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StatusRecord>, RepositoryError>> + Send;
}
