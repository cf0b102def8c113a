//! Status channel: versioned progress records attached to runs.
//!
//! Writes come from job bodies as checkpointed steps, so a replay returns the
//! recorded snapshot instead of applying the update again. Readers get
//! snapshots or a watch receiver that only ever moves forward in version.
//!
//! The status write and the step record that checkpoints it are two store
//! writes. A crash between them re-applies the update on recovery, so the
//! status ends up one version further than the number of updates the body
//! made. Field values are unaffected since an update is an overwrite.

use std::sync::Arc;

use dashmap::DashMap;
use tether_types::event::RunEvent;
use tether_types::status::{StatusRecord, StatusUpdate};
use tether_types::step::{ErrorInfo, StepKind, StepRecord, StepState};
use tokio::sync::watch;
use uuid::Uuid;

use crate::event::EventBus;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::clock::TimerService;
use super::executor::ensure_kind;
use super::job::JobError;

pub struct StatusChannel {
    checkpoint: Arc<CheckpointManager>,
    timer: Arc<TimerService>,
    events: EventBus,
    watchers: DashMap<(Uuid, String), watch::Sender<StatusRecord>>,
}

impl StatusChannel {
    pub fn new(checkpoint: Arc<CheckpointManager>, timer: Arc<TimerService>, events: EventBus) -> Self {
        Self {
            checkpoint,
            timer,
            events,
            watchers: DashMap::new(),
        }
    }

    /// Apply `update` to status `key` as the step `step_key` of `run_id`.
    ///
    /// If the step was already recorded, the recorded snapshot is returned
    /// and the status is left untouched.
    pub(crate) async fn apply(
        &self,
        run_id: Uuid,
        step_key: &str,
        key: &str,
        update: &StatusUpdate,
    ) -> Result<StatusRecord, JobError> {
        if let Some(step) = self.checkpoint.get_step(run_id, step_key).await? {
            ensure_kind(&step, StepKind::Status)?;
            return recorded_snapshot(step);
        }

        let now = self.timer.now();
        let record = self.checkpoint.apply_status(run_id, key, update, now).await?;
        let output = serde_json::to_value(&record).map_err(|e| JobError::Serialization(e.to_string()))?;
        let stored = self
            .checkpoint
            .record_step(&StepRecord::completed(run_id, step_key, StepKind::Status, output, now))
            .await?;

        self.publish(&record);
        self.events.publish(RunEvent::StatusUpdated {
            run_id,
            key: key.to_string(),
            version: record.version,
        });
        self.events.publish(RunEvent::StepCompleted {
            run_id,
            step_key: step_key.to_string(),
            kind: StepKind::Status,
        });
        recorded_snapshot(stored)
    }

    /// Current snapshot of one status.
    pub async fn get(&self, run_id: Uuid, key: &str) -> Result<Option<StatusRecord>, CheckpointError> {
        self.checkpoint.get_status(run_id, key).await
    }

    /// All statuses of a run, ordered by key.
    pub async fn list(&self, run_id: Uuid) -> Result<Vec<StatusRecord>, CheckpointError> {
        self.checkpoint.list_statuses(run_id).await
    }

    /// Subscribe to a status. The receiver starts at the current snapshot
    /// (version 0 if the status does not exist yet).
    pub async fn watch(&self, run_id: Uuid, key: &str) -> Result<watch::Receiver<StatusRecord>, CheckpointError> {
        if let Some(tx) = self.watchers.get(&(run_id, key.to_string())) {
            return Ok(tx.subscribe());
        }

        let current = self
            .get(run_id, key)
            .await?
            .unwrap_or_else(|| StatusRecord::empty(run_id, key, self.timer.now()));
        let rx = self
            .watchers
            .entry((run_id, key.to_string()))
            .or_insert_with(|| watch::channel(current.clone()).0)
            .subscribe();

        // An update may have landed between the read and the registration.
        if let Some(latest) = self.get(run_id, key).await? {
            self.publish(&latest);
        }
        Ok(rx)
    }

    /// Push a snapshot to watchers unless they already hold a newer version.
    fn publish(&self, record: &StatusRecord) {
        if let Some(tx) = self.watchers.get(&(record.run_id, record.key.clone())) {
            tx.send_if_modified(|current| {
                if record.version > current.version {
                    *current = record.clone();
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Drop watch channels for a finished run.
    pub(crate) fn forget_run(&self, run_id: Uuid) {
        self.watchers.retain(|(id, _), _| *id != run_id);
    }
}

impl std::fmt::Debug for StatusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusChannel")
            .field("watchers", &self.watchers.len())
            .finish()
    }
}

fn recorded_snapshot(step: StepRecord) -> Result<StatusRecord, JobError> {
    match step.state {
        StepState::Completed => {
            let output = step.output.unwrap_or_default();
            serde_json::from_value(output).map_err(|e| JobError::Serialization(e.to_string()))
        }
        _ => Err(JobError::StepFailed {
            step_key: step.step_key,
            error: step
                .error
                .unwrap_or_else(|| ErrorInfo::new("StatusError", "status update was not recorded")),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use tether_types::status::StatusState;

    use crate::engine::scheduler::ResumeSender;
    use crate::repository::{BoxCheckpointStore, InMemoryCheckpointStore};

    fn channel() -> StatusChannel {
        let (sender, _rx) = ResumeSender::channel();
        let checkpoint = Arc::new(CheckpointManager::new(BoxCheckpointStore::new(
            InMemoryCheckpointStore::new(),
        )));
        StatusChannel::new(checkpoint, Arc::new(TimerService::new(sender)), EventBus::new(16))
    }

    fn progress(value: i64) -> Map<String, serde_json::Value> {
        let mut data = Map::new();
        data.insert("progress".to_string(), json!(value));
        data
    }

    #[tokio::test]
    async fn updates_merge_per_field() {
        let statuses = channel();
        let run_id = Uuid::now_v7();

        statuses
            .apply(
                run_id,
                "generating-memes",
                "generating-memes",
                &StatusUpdate::new().label("Generating memes").state("loading"),
            )
            .await
            .unwrap();
        let record = statuses
            .apply(
                run_id,
                "middle-generation",
                "generating-memes",
                &StatusUpdate::new().state("success").data(progress(1)),
            )
            .await
            .unwrap();

        assert_eq!(record.label.as_deref(), Some("Generating memes"));
        assert_eq!(record.state, Some(StatusState::Success));
        assert_eq!(record.data, Some(progress(1)));
        assert_eq!(record.version, 2);
        assert_eq!(statuses.get(run_id, "generating-memes").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn replayed_update_is_not_reapplied() {
        let statuses = channel();
        let run_id = Uuid::now_v7();
        let update = StatusUpdate::new().label("Working");

        let first = statuses.apply(run_id, "s1", "progress", &update).await.unwrap();
        let replay = statuses.apply(run_id, "s1", "progress", &update).await.unwrap();
        assert_eq!(first, replay);
        assert_eq!(statuses.get(run_id, "progress").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn update_without_step_record_is_applied_again() {
        let statuses = channel();
        let run_id = Uuid::now_v7();
        let update = StatusUpdate::new().label("Working").state("loading");

        // Status written, then the process died before recording step s1.
        statuses
            .checkpoint
            .apply_status(run_id, "progress", &update, chrono::Utc::now())
            .await
            .unwrap();

        let record = statuses.apply(run_id, "s1", "progress", &update).await.unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.label.as_deref(), Some("Working"));
        assert_eq!(record.state, Some(StatusState::Loading));
    }

    #[tokio::test]
    async fn watchers_only_move_forward() {
        let statuses = channel();
        let run_id = Uuid::now_v7();
        let mut rx = statuses.watch(run_id, "progress").await.unwrap();
        assert_eq!(rx.borrow().version, 0);

        statuses
            .apply(run_id, "s1", "progress", &StatusUpdate::new().data(progress(1)))
            .await
            .unwrap();
        statuses
            .apply(run_id, "s2", "progress", &StatusUpdate::new().data(progress(2)))
            .await
            .unwrap();

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().version, 2);

        // Re-publishing an older snapshot is ignored.
        let mut stale = StatusRecord::empty(run_id, "progress", chrono::Utc::now());
        stale.version = 1;
        statuses.publish(&stale);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(rx.borrow().data, Some(progress(2)));
    }
}
