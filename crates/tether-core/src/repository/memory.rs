//! In-memory checkpoint store.
//!
//! Backed by `DashMap`s. Each run's steps live in one map entry, so every
//! step operation holds that entry's shard lock for its whole
//! check-then-write and is atomic per run. Used by tests and embedded hosts
//! that do not need durability across restarts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_types::error::RepositoryError;
use tether_types::invocation::InvocationResult;
use tether_types::run::{RunRecord, RunStatus};
use tether_types::status::{StatusRecord, StatusUpdate};
use tether_types::step::{StepRecord, StepState};
use uuid::Uuid;

use super::checkpoint::CheckpointStore;

/// `CheckpointStore` kept entirely in process memory.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    runs: DashMap<Uuid, RunRecord>,
    /// Steps per run, in recording order.
    steps: DashMap<Uuid, Vec<StepRecord>>,
    statuses: DashMap<(Uuid, String), StatusRecord>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_newest_first(runs: &mut [RunRecord]) {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

fn sort_oldest_first(runs: &mut [RunRecord]) {
    runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

impl CheckpointStore for InMemoryCheckpointStore {
    async fn create_run(&self, run: &RunRecord) -> Result<bool, RepositoryError> {
        match self.runs.entry(run.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(run.clone());
                Ok(true)
            }
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        Ok(self.runs.get(run_id).map(|r| r.clone()))
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let mut stored = self.runs.get_mut(&run.id).ok_or(RepositoryError::NotFound)?;
        *stored = run.clone();
        Ok(())
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| status.is_none_or(|s| r.status == s))
            .map(|r| r.clone())
            .collect();
        sort_newest_first(&mut runs);
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.clone())
            .collect();
        sort_oldest_first(&mut runs);
        Ok(runs)
    }

    async fn list_child_runs(&self, parent_id: &Uuid) -> Result<Vec<RunRecord>, RepositoryError> {
        let mut runs: Vec<RunRecord> = self
            .runs
            .iter()
            .filter(|r| r.parent.as_ref().is_some_and(|p| p.run_id == *parent_id))
            .map(|r| r.clone())
            .collect();
        sort_oldest_first(&mut runs);
        Ok(runs)
    }

    async fn get_step(
        &self,
        run_id: &Uuid,
        step_key: &str,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        Ok(self
            .steps
            .get(run_id)
            .and_then(|steps| steps.iter().find(|s| s.step_key == step_key).cloned()))
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        Ok(self
            .steps
            .get(run_id)
            .map(|steps| steps.clone())
            .unwrap_or_default())
    }

    async fn insert_step(&self, step: &StepRecord) -> Result<StepRecord, RepositoryError> {
        let mut steps = self.steps.entry(step.run_id).or_default();
        if let Some(existing) = steps.iter().find(|s| s.step_key == step.step_key) {
            return Ok(existing.clone());
        }
        let mut stored = step.clone();
        stored.seq = steps.len() as u64 + 1;
        steps.push(stored.clone());
        Ok(stored)
    }

    async fn update_step(
        &self,
        step: &StepRecord,
        expected: StepState,
    ) -> Result<StepRecord, RepositoryError> {
        let mut steps = self
            .steps
            .get_mut(&step.run_id)
            .ok_or(RepositoryError::NotFound)?;
        let existing = steps
            .iter_mut()
            .find(|s| s.step_key == step.step_key)
            .ok_or(RepositoryError::NotFound)?;
        if existing.state != expected {
            return Ok(existing.clone());
        }
        let seq = existing.seq;
        let created_at = existing.created_at;
        *existing = step.clone();
        existing.seq = seq;
        existing.created_at = created_at;
        Ok(existing.clone())
    }

    async fn resolve_child(
        &self,
        run_id: &Uuid,
        step_key: &str,
        index: usize,
        result: &InvocationResult,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        let mut steps = self.steps.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        let step = steps
            .iter_mut()
            .find(|s| s.step_key == step_key)
            .ok_or(RepositoryError::NotFound)?;
        if step.state != StepState::Pending {
            return Ok(None);
        }
        let slot = step.child_results.get_mut(index).ok_or_else(|| {
            RepositoryError::Conflict(format!(
                "child index {index} out of range for step '{step_key}'"
            ))
        })?;
        if slot.is_some() {
            return Ok(None);
        }
        *slot = Some(result.clone());
        if step.all_children_resolved() {
            Ok(Some(step.clone()))
        } else {
            Ok(None)
        }
    }

    async fn apply_status(
        &self,
        run_id: &Uuid,
        key: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusRecord, RepositoryError> {
        let mut record = self
            .statuses
            .entry((*run_id, key.to_string()))
            .or_insert_with(|| StatusRecord::empty(*run_id, key, now));
        record.apply(update, now);
        Ok(record.clone())
    }

    async fn get_status(
        &self,
        run_id: &Uuid,
        key: &str,
    ) -> Result<Option<StatusRecord>, RepositoryError> {
        Ok(self
            .statuses
            .get(&(*run_id, key.to_string()))
            .map(|r| r.clone()))
    }

    async fn list_statuses(&self, run_id: &Uuid) -> Result<Vec<StatusRecord>, RepositoryError> {
        let mut records: Vec<StatusRecord> = self
            .statuses
            .iter()
            .filter(|r| r.run_id == *run_id)
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_types::step::StepKind;
    use tether_types::trigger::TriggerKind;

    fn sample_run() -> RunRecord {
        RunRecord::new(
            Uuid::now_v7(),
            "auto-yield-1",
            "1.0.0",
            TriggerKind::Event,
            json!({}),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_run_is_insert_if_absent() {
        let store = InMemoryCheckpointStore::new();
        let run = sample_run();
        assert!(store.create_run(&run).await.unwrap());
        assert!(!store.create_run(&run).await.unwrap());
        assert_eq!(store.list_runs(None, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insert_step_keeps_first_record_and_assigns_seq() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let now = Utc::now();

        let a = store
            .insert_step(&StepRecord::completed(run_id, "a", StepKind::Task, json!(1), now))
            .await
            .unwrap();
        let b = store
            .insert_step(&StepRecord::completed(run_id, "b", StepKind::Task, json!(2), now))
            .await
            .unwrap();
        let again = store
            .insert_step(&StepRecord::completed(run_id, "a", StepKind::Task, json!(99), now))
            .await
            .unwrap();

        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(again.output, Some(json!(1)), "first write wins");

        let keys: Vec<_> = store
            .list_steps(&run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step_key)
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn update_step_compares_state() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let now = Utc::now();
        store
            .insert_step(&StepRecord::pending(run_id, "w", StepKind::Wait, now))
            .await
            .unwrap();

        let done = StepRecord::completed(run_id, "w", StepKind::Wait, json!(null), now);
        let stale = store.update_step(&done, StepState::Ready).await.unwrap();
        assert_eq!(stale.state, StepState::Pending, "mismatched state is not written");

        let stored = store.update_step(&done, StepState::Pending).await.unwrap();
        assert_eq!(stored.state, StepState::Completed);
        assert_eq!(stored.seq, 1);
    }

    #[tokio::test]
    async fn resolve_child_reports_join_once() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let now = Utc::now();
        let children = vec![Uuid::now_v7(), Uuid::now_v7()];
        let mut step = StepRecord::pending(run_id, "batch", StepKind::Invocation, now);
        step.children = children.clone();
        step.child_results = vec![None, None];
        store.insert_step(&step).await.unwrap();

        let second = InvocationResult::success(children[1], json!("b"));
        assert!(store
            .resolve_child(&run_id, "batch", 1, &second)
            .await
            .unwrap()
            .is_none());
        // Filling the same slot again changes nothing.
        assert!(store
            .resolve_child(&run_id, "batch", 1, &second)
            .await
            .unwrap()
            .is_none());

        let first = InvocationResult::success(children[0], json!("a"));
        let joined = store
            .resolve_child(&run_id, "batch", 0, &first)
            .await
            .unwrap()
            .expect("last slot completes the join");
        assert!(joined.all_children_resolved());

        let out_of_range = store.resolve_child(&run_id, "batch", 5, &first).await;
        assert!(matches!(out_of_range, Err(RepositoryError::Conflict(_))));
    }

    #[tokio::test]
    async fn apply_status_bumps_version() {
        let store = InMemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let now = Utc::now();
        let first = store
            .apply_status(&run_id, "status-1", &StatusUpdate::new().label("Working"), now)
            .await
            .unwrap();
        let second = store
            .apply_status(&run_id, "status-1", &StatusUpdate::new().state("success"), now)
            .await
            .unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(second.label.as_deref(), Some("Working"));
        assert_eq!(store.list_statuses(&run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unfinished_runs_exclude_terminal() {
        let store = InMemoryCheckpointStore::new();
        let waiting = sample_run();
        let mut done = sample_run();
        done.status = RunStatus::Completed;
        store.create_run(&waiting).await.unwrap();
        store.create_run(&done).await.unwrap();

        let unfinished = store.list_unfinished_runs().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, waiting.id);
    }
}
