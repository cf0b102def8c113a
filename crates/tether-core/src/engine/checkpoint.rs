//! Durable checkpoint manager for run execution state.
//!
//! Wraps [`BoxCheckpointStore`] to provide the higher-level operations the
//! engine needs: recording step outcomes, compare-and-set transitions when a
//! timer fires, child-slot resolution, and run status persistence. Every
//! write is logged at `debug` with the run and step it touched.

use chrono::{DateTime, Utc};
use tether_types::invocation::InvocationResult;
use tether_types::run::{RunRecord, RunStatus};
use tether_types::status::{StatusRecord, StatusUpdate};
use tether_types::step::{StepKind, StepRecord, StepState};
use uuid::Uuid;

use crate::repository::BoxCheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointError
// ---------------------------------------------------------------------------

/// Errors that can occur while reading or writing checkpoints.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository error.
    #[error("repository error: {0}")]
    Repository(String),

    /// A record that must exist was not found.
    #[error("run {run_id} has no step '{step_key}'")]
    StepNotFound { run_id: Uuid, step_key: String },

    /// A run that must exist was not found.
    #[error("run {0} not found")]
    RunNotFound(Uuid),

    /// A stored output could not be decoded.
    #[error("stored checkpoint is malformed: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for runs.
///
/// Every state transition is persisted before the engine moves forward, so
/// an interrupted run can be replayed from its checkpoints.
pub struct CheckpointManager {
    store: BoxCheckpointStore,
}

impl CheckpointManager {
    /// Create a new checkpoint manager backed by the given store.
    pub fn new(store: BoxCheckpointStore) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &BoxCheckpointStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Persist a new run. Returns `false` if the run already existed.
    pub async fn create_run(&self, run: &RunRecord) -> Result<bool, CheckpointError> {
        let created = self
            .store
            .create_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run.id,
            job_id = %run.job_id,
            created,
            "checkpointed run creation"
        );
        Ok(created)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, CheckpointError> {
        self.store
            .get_run(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Load a run that is expected to exist.
    pub async fn require_run(&self, run_id: Uuid) -> Result<RunRecord, CheckpointError> {
        self.get_run(run_id)
            .await?
            .ok_or(CheckpointError::RunNotFound(run_id))
    }

    /// Persist a run's status, cursor and outcome.
    pub async fn checkpoint_run(&self, run: &RunRecord) -> Result<(), CheckpointError> {
        self.store
            .update_run(run)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run.id,
            status = %run.status,
            resolved_steps = run.cursor.resolved_steps,
            "checkpointed run status"
        );
        Ok(())
    }

    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, CheckpointError> {
        self.store
            .list_runs(status, limit)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn list_unfinished_runs(&self) -> Result<Vec<RunRecord>, CheckpointError> {
        self.store
            .list_unfinished_runs()
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn list_child_runs(&self, parent_id: Uuid) -> Result<Vec<RunRecord>, CheckpointError> {
        self.store
            .list_child_runs(&parent_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    pub async fn get_step(
        &self,
        run_id: Uuid,
        step_key: &str,
    ) -> Result<Option<StepRecord>, CheckpointError> {
        self.store
            .get_step(&run_id, step_key)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, CheckpointError> {
        self.store
            .list_steps(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Record a step for the first time. If the key was already recorded,
    /// the stored record is returned unchanged.
    pub async fn record_step(&self, step: &StepRecord) -> Result<StepRecord, CheckpointError> {
        let stored = self
            .store
            .insert_step(step)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %step.run_id,
            step_key = %step.step_key,
            state = stored.state.as_str(),
            seq = stored.seq,
            "checkpointed step"
        );
        Ok(stored)
    }

    /// Move a step from `expected` to the state carried by `step`.
    ///
    /// Returns the stored record; callers compare its state to learn whether
    /// the transition won.
    pub async fn transition_step(
        &self,
        step: &StepRecord,
        expected: StepState,
    ) -> Result<StepRecord, CheckpointError> {
        let stored = self
            .store
            .update_step(step, expected)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %step.run_id,
            step_key = %step.step_key,
            from = expected.as_str(),
            to = stored.state.as_str(),
            "checkpointed step transition"
        );
        Ok(stored)
    }

    /// Apply a fired timer to its step.
    ///
    /// A pending wait becomes `Completed`; a pending retry backoff becomes
    /// `Ready`. Steps in any other state, or whose wake time has not arrived,
    /// are left alone so duplicate or early wakes are harmless.
    pub async fn fire_timer(
        &self,
        run_id: Uuid,
        step_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(), CheckpointError> {
        let Some(step) = self.get_step(run_id, step_key).await? else {
            tracing::debug!(run_id = %run_id, step_key, "timer fired for unknown step");
            return Ok(());
        };
        if step.state != StepState::Pending {
            return Ok(());
        }
        if step.wake_at.is_some_and(|at| at > now) {
            tracing::debug!(run_id = %run_id, step_key, "timer fired early; ignoring");
            return Ok(());
        }

        let mut next = step.clone();
        match step.kind {
            StepKind::Wait => {
                next.state = StepState::Completed;
                next.output = Some(serde_json::Value::Null);
                next.completed_at = Some(now);
            }
            StepKind::Task | StepKind::BackgroundCall => {
                next.state = StepState::Ready;
            }
            _ => return Ok(()),
        }
        self.transition_step(&next, StepState::Pending).await?;
        Ok(())
    }

    /// Fill one child slot of an invocation step. Returns the record when
    /// this call completed the join.
    pub async fn resolve_child(
        &self,
        run_id: Uuid,
        step_key: &str,
        index: usize,
        result: &InvocationResult,
    ) -> Result<Option<StepRecord>, CheckpointError> {
        let joined = self
            .store
            .resolve_child(&run_id, step_key, index, result)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            run_id = %run_id,
            step_key,
            index,
            ok = result.ok,
            joined = joined.is_some(),
            "checkpointed child result"
        );
        Ok(joined)
    }

    // -----------------------------------------------------------------------
    // Statuses
    // -----------------------------------------------------------------------

    pub async fn apply_status(
        &self,
        run_id: Uuid,
        key: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusRecord, CheckpointError> {
        let record = self
            .store
            .apply_status(&run_id, key, update, now)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(run_id = %run_id, key, version = record.version, "checkpointed status");
        Ok(record)
    }

    pub async fn get_status(
        &self,
        run_id: Uuid,
        key: &str,
    ) -> Result<Option<StatusRecord>, CheckpointError> {
        self.store
            .get_status(&run_id, key)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    pub async fn list_statuses(&self, run_id: Uuid) -> Result<Vec<StatusRecord>, CheckpointError> {
        self.store
            .list_statuses(&run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryCheckpointStore;
    use serde_json::json;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(BoxCheckpointStore::new(InMemoryCheckpointStore::new()))
    }

    #[tokio::test]
    async fn fire_timer_completes_wait() {
        let cp = manager();
        let run_id = Uuid::now_v7();
        let now = Utc::now();
        let mut wait = StepRecord::pending(run_id, "wait-1", StepKind::Wait, now);
        wait.wake_at = Some(now);
        cp.record_step(&wait).await.unwrap();

        cp.fire_timer(run_id, "wait-1", now).await.unwrap();

        let stored = cp.get_step(run_id, "wait-1").await.unwrap().unwrap();
        assert_eq!(stored.state, StepState::Completed);
        assert_eq!(stored.output, Some(json!(null)));
    }

    #[tokio::test]
    async fn fire_timer_marks_retry_ready() {
        let cp = manager();
        let run_id = Uuid::now_v7();
        let now = Utc::now();
        let mut task = StepRecord::pending(run_id, "task-1", StepKind::Task, now);
        task.attempt = 1;
        task.wake_at = Some(now);
        cp.record_step(&task).await.unwrap();

        cp.fire_timer(run_id, "task-1", now).await.unwrap();
        // A duplicate wake leaves the ready record alone.
        cp.fire_timer(run_id, "task-1", now).await.unwrap();

        let stored = cp.get_step(run_id, "task-1").await.unwrap().unwrap();
        assert_eq!(stored.state, StepState::Ready);
        assert_eq!(stored.attempt, 1);
    }

    #[tokio::test]
    async fn early_timer_is_ignored() {
        let cp = manager();
        let run_id = Uuid::now_v7();
        let now = Utc::now();
        let mut wait = StepRecord::pending(run_id, "wait-1", StepKind::Wait, now);
        wait.wake_at = Some(now + chrono::Duration::seconds(30));
        cp.record_step(&wait).await.unwrap();

        cp.fire_timer(run_id, "wait-1", now).await.unwrap();

        let stored = cp.get_step(run_id, "wait-1").await.unwrap().unwrap();
        assert_eq!(stored.state, StepState::Pending);
    }

    #[tokio::test]
    async fn require_run_reports_missing() {
        let cp = manager();
        let id = Uuid::now_v7();
        let err = cp.require_run(id).await.unwrap_err();
        assert!(matches!(err, CheckpointError::RunNotFound(missing) if missing == id));
    }
}
