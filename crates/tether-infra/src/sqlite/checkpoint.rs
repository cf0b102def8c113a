//! SQLite checkpoint store.
//!
//! Implements `CheckpointStore` from `tether-core`. JSON-valued fields are
//! stored as TEXT. Every check-then-write runs in a transaction on the
//! single-connection writer pool, so it cannot interleave with another write.

use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tether_core::repository::CheckpointStore;
use tether_types::error::RepositoryError;
use tether_types::invocation::InvocationResult;
use tether_types::run::{RunCursor, RunRecord, RunStatus};
use tether_types::status::{StatusRecord, StatusState, StatusUpdate};
use tether_types::step::{StepRecord, StepState};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    job_id: String,
    job_version: String,
    trigger_kind: String,
    payload: String,
    status: String,
    resolved_steps: i64,
    waiting_on: Option<String>,
    parent: Option<String>,
    callback_url: Option<String>,
    output: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            job_version: row.try_get("job_version")?,
            trigger_kind: row.try_get("trigger_kind")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            resolved_steps: row.try_get("resolved_steps")?,
            waiting_on: row.try_get("waiting_on")?,
            parent: row.try_get("parent")?,
            callback_url: row.try_get("callback_url")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_run(self) -> Result<RunRecord, RepositoryError> {
        Ok(RunRecord {
            id: parse_uuid(&self.id)?,
            job_id: self.job_id,
            job_version: self.job_version,
            trigger: parse_enum(&self.trigger_kind)?,
            payload: from_json(&self.payload, "payload")?,
            status: parse_enum(&self.status)?,
            cursor: RunCursor {
                resolved_steps: self.resolved_steps as u32,
                waiting_on: self.waiting_on,
            },
            parent: opt_from_json(self.parent.as_deref(), "parent")?,
            callback_url: self.callback_url,
            output: opt_from_json(self.output.as_deref(), "output")?,
            error: opt_from_json(self.error.as_deref(), "error")?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepRow {
    run_id: String,
    step_key: String,
    kind: String,
    state: String,
    seq: i64,
    attempt: i64,
    output: Option<String>,
    error: Option<String>,
    wake_at: Option<String>,
    deadline: Option<String>,
    children: String,
    child_results: String,
    created_at: String,
    completed_at: Option<String>,
}

impl StepRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            step_key: row.try_get("step_key")?,
            kind: row.try_get("kind")?,
            state: row.try_get("state")?,
            seq: row.try_get("seq")?,
            attempt: row.try_get("attempt")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            wake_at: row.try_get("wake_at")?,
            deadline: row.try_get("deadline")?,
            children: row.try_get("children")?,
            child_results: row.try_get("child_results")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_step(self) -> Result<StepRecord, RepositoryError> {
        Ok(StepRecord {
            run_id: parse_uuid(&self.run_id)?,
            step_key: self.step_key,
            kind: parse_enum(&self.kind)?,
            state: parse_enum(&self.state)?,
            seq: self.seq as u64,
            attempt: self.attempt as u32,
            output: opt_from_json(self.output.as_deref(), "step output")?,
            error: opt_from_json(self.error.as_deref(), "step error")?,
            wake_at: self.wake_at.as_deref().map(parse_datetime).transpose()?,
            deadline: self.deadline.as_deref().map(parse_datetime).transpose()?,
            children: from_json(&self.children, "children")?,
            child_results: from_json(&self.child_results, "child_results")?,
            created_at: parse_datetime(&self.created_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

/// Serialized form of a step's mutable columns.
struct StepColumns {
    output: Option<String>,
    error: Option<String>,
    wake_at: Option<String>,
    deadline: Option<String>,
    children: String,
    child_results: String,
    completed_at: Option<String>,
}

impl StepColumns {
    fn new(step: &StepRecord) -> Result<Self, RepositoryError> {
        Ok(Self {
            output: step.output.as_ref().map(|v| to_json(v, "step output")).transpose()?,
            error: step.error.as_ref().map(|v| to_json(v, "step error")).transpose()?,
            wake_at: step.wake_at.as_ref().map(format_datetime),
            deadline: step.deadline.as_ref().map(format_datetime),
            children: to_json(&step.children, "children")?,
            child_results: to_json(&step.child_results, "child_results")?,
            completed_at: step.completed_at.as_ref().map(format_datetime),
        })
    }
}

struct StatusRow {
    run_id: String,
    key: String,
    label: Option<String>,
    state: Option<String>,
    data: Option<String>,
    version: i64,
    updated_at: String,
}

impl StatusRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            key: row.try_get("key")?,
            label: row.try_get("label")?,
            state: row.try_get("state")?,
            data: row.try_get("data")?,
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_status(self) -> Result<StatusRecord, RepositoryError> {
        Ok(StatusRecord {
            run_id: parse_uuid(&self.run_id)?,
            key: self.key,
            label: self.label,
            state: self.state.as_deref().map(StatusState::from),
            data: opt_from_json(self.data.as_deref(), "status data")?,
            version: self.version as u64,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn query_err(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T, RepositoryError> {
    s.parse::<T>().map_err(RepositoryError::Query)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339, so ORDER BY on the column is chronological.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn from_json<T: DeserializeOwned>(s: &str, what: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {what} JSON: {e}")))
}

fn opt_from_json<T: DeserializeOwned>(s: Option<&str>, what: &str) -> Result<Option<T>, RepositoryError> {
    s.map(|s| from_json(s, what)).transpose()
}

fn runs_from_rows(rows: &[SqliteRow]) -> Result<Vec<RunRecord>, RepositoryError> {
    let mut runs = Vec::with_capacity(rows.len());
    for row in rows {
        runs.push(RunRow::from_row(row).map_err(query_err)?.into_run()?);
    }
    Ok(runs)
}

async fn fetch_step(
    conn: &mut sqlx::SqliteConnection,
    run_id: &Uuid,
    step_key: &str,
) -> Result<Option<StepRecord>, RepositoryError> {
    let row = sqlx::query("SELECT * FROM steps WHERE run_id = ? AND step_key = ?")
        .bind(run_id.to_string())
        .bind(step_key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_err)?;
    row.map(|row| StepRow::from_row(&row).map_err(query_err)?.into_step())
        .transpose()
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn create_run(&self, run: &RunRecord) -> Result<bool, RepositoryError> {
        let parent = run.parent.as_ref().map(|p| to_json(p, "parent")).transpose()?;
        let output = run.output.as_ref().map(|v| to_json(v, "output")).transpose()?;
        let error = run.error.as_ref().map(|v| to_json(v, "error")).transpose()?;

        let result = sqlx::query(
            r#"INSERT INTO runs
               (id, job_id, job_version, trigger_kind, payload, status, resolved_steps, waiting_on,
                parent_run_id, parent, callback_url, output, error, created_at, updated_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO NOTHING"#,
        )
        .bind(run.id.to_string())
        .bind(&run.job_id)
        .bind(&run.job_version)
        .bind(run.trigger.as_str())
        .bind(to_json(&run.payload, "payload")?)
        .bind(run.status.as_str())
        .bind(i64::from(run.cursor.resolved_steps))
        .bind(&run.cursor.waiting_on)
        .bind(run.parent.as_ref().map(|p| p.run_id.to_string()))
        .bind(&parent)
        .bind(&run.callback_url)
        .bind(&output)
        .bind(&error)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<RunRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(Some(RunRow::from_row(&row).map_err(query_err)?.into_run()?)),
            None => Ok(None),
        }
    }

    async fn update_run(&self, run: &RunRecord) -> Result<(), RepositoryError> {
        let output = run.output.as_ref().map(|v| to_json(v, "output")).transpose()?;
        let error = run.error.as_ref().map(|v| to_json(v, "error")).transpose()?;

        let result = sqlx::query(
            r#"UPDATE runs SET
                 status = ?, resolved_steps = ?, waiting_on = ?, output = ?, error = ?,
                 updated_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(run.status.as_str())
        .bind(i64::from(run.cursor.resolved_steps))
        .bind(&run.cursor.waiting_on)
        .bind(&output)
        .bind(&error)
        .bind(format_datetime(&run.updated_at))
        .bind(run.completed_at.as_ref().map(format_datetime))
        .bind(run.id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: u32,
    ) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM runs WHERE status = ? ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(status.as_str())
                .bind(i64::from(limit))
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM runs ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(i64::from(limit))
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(query_err)?;

        runs_from_rows(&rows)
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE status NOT IN ('completed', 'failed') ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        runs_from_rows(&rows)
    }

    async fn list_child_runs(&self, parent_id: &Uuid) -> Result<Vec<RunRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM runs WHERE parent_run_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(parent_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        runs_from_rows(&rows)
    }

    async fn get_step(
        &self,
        run_id: &Uuid,
        step_key: &str,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        let mut conn = self.pool.reader.acquire().await.map_err(query_err)?;
        fetch_step(&mut conn, run_id, step_key).await
    }

    async fn list_steps(&self, run_id: &Uuid) -> Result<Vec<StepRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM steps WHERE run_id = ? ORDER BY seq ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut steps = Vec::with_capacity(rows.len());
        for row in &rows {
            steps.push(StepRow::from_row(row).map_err(query_err)?.into_step()?);
        }
        Ok(steps)
    }

    async fn insert_step(&self, step: &StepRecord) -> Result<StepRecord, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        if let Some(existing) = fetch_step(&mut tx, &step.run_id, &step.step_key).await? {
            tx.commit().await.map_err(query_err)?;
            return Ok(existing);
        }

        let (seq,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(seq), 0) + 1 FROM steps WHERE run_id = ?")
                .bind(step.run_id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(query_err)?;

        let mut stored = step.clone();
        stored.seq = seq as u64;
        let cols = StepColumns::new(&stored)?;

        sqlx::query(
            r#"INSERT INTO steps
               (run_id, step_key, kind, state, seq, attempt, output, error, wake_at, deadline,
                children, child_results, created_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(stored.run_id.to_string())
        .bind(&stored.step_key)
        .bind(stored.kind.as_str())
        .bind(stored.state.as_str())
        .bind(seq)
        .bind(i64::from(stored.attempt))
        .bind(&cols.output)
        .bind(&cols.error)
        .bind(&cols.wake_at)
        .bind(&cols.deadline)
        .bind(&cols.children)
        .bind(&cols.child_results)
        .bind(format_datetime(&stored.created_at))
        .bind(&cols.completed_at)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        tracing::debug!(run_id = %stored.run_id, step_key = %stored.step_key, seq, "step inserted");
        Ok(stored)
    }

    async fn update_step(
        &self,
        step: &StepRecord,
        expected: StepState,
    ) -> Result<StepRecord, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let existing = fetch_step(&mut tx, &step.run_id, &step.step_key)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        if existing.state != expected {
            tx.commit().await.map_err(query_err)?;
            return Ok(existing);
        }

        let cols = StepColumns::new(step)?;
        sqlx::query(
            r#"UPDATE steps SET
                 kind = ?, state = ?, attempt = ?, output = ?, error = ?, wake_at = ?,
                 deadline = ?, children = ?, child_results = ?, completed_at = ?
               WHERE run_id = ? AND step_key = ?"#,
        )
        .bind(step.kind.as_str())
        .bind(step.state.as_str())
        .bind(i64::from(step.attempt))
        .bind(&cols.output)
        .bind(&cols.error)
        .bind(&cols.wake_at)
        .bind(&cols.deadline)
        .bind(&cols.children)
        .bind(&cols.child_results)
        .bind(&cols.completed_at)
        .bind(step.run_id.to_string())
        .bind(&step.step_key)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;

        let mut stored = step.clone();
        stored.seq = existing.seq;
        stored.created_at = existing.created_at;
        Ok(stored)
    }

    async fn resolve_child(
        &self,
        run_id: &Uuid,
        step_key: &str,
        index: usize,
        result: &InvocationResult,
    ) -> Result<Option<StepRecord>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let mut step = fetch_step(&mut tx, run_id, step_key)
            .await?
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

        sqlx::query("UPDATE steps SET child_results = ? WHERE run_id = ? AND step_key = ?")
            .bind(to_json(&step.child_results, "child_results")?)
            .bind(run_id.to_string())
            .bind(step_key)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;
        tx.commit().await.map_err(query_err)?;

        tracing::debug!(run_id = %run_id, step_key, index, "child slot resolved");
        Ok(step.all_children_resolved().then_some(step))
    }

    async fn apply_status(
        &self,
        run_id: &Uuid,
        key: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
    ) -> Result<StatusRecord, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let row = sqlx::query("SELECT * FROM statuses WHERE run_id = ? AND key = ?")
            .bind(run_id.to_string())
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;
        let mut record = match row {
            Some(row) => StatusRow::from_row(&row).map_err(query_err)?.into_status()?,
            None => StatusRecord::empty(*run_id, key, now),
        };
        record.apply(update, now);

        let data = record.data.as_ref().map(|d| to_json(d, "status data")).transpose()?;
        sqlx::query(
            r#"INSERT INTO statuses (run_id, key, label, state, data, version, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id, key) DO UPDATE SET
                 label = excluded.label,
                 state = excluded.state,
                 data = excluded.data,
                 version = excluded.version,
                 updated_at = excluded.updated_at"#,
        )
        .bind(run_id.to_string())
        .bind(key)
        .bind(&record.label)
        .bind(record.state.as_ref().map(|s| s.as_str().to_string()))
        .bind(&data)
        .bind(record.version as i64)
        .bind(format_datetime(&record.updated_at))
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        Ok(record)
    }

    async fn get_status(
        &self,
        run_id: &Uuid,
        key: &str,
    ) -> Result<Option<StatusRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM statuses WHERE run_id = ? AND key = ?")
            .bind(run_id.to_string())
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_err)?;

        match row {
            Some(row) => Ok(Some(StatusRow::from_row(&row).map_err(query_err)?.into_status()?)),
            None => Ok(None),
        }
    }

    async fn list_statuses(&self, run_id: &Uuid) -> Result<Vec<StatusRecord>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM statuses WHERE run_id = ? ORDER BY key ASC")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let mut statuses = Vec::with_capacity(rows.len());
        for row in &rows {
            statuses.push(StatusRow::from_row(row).map_err(query_err)?.into_status()?);
        }
        Ok(statuses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};
    use std::sync::Arc;
    use tether_types::run::ParentLink;
    use tether_types::step::{ErrorInfo, StepKind};
    use tether_types::trigger::TriggerKind;

    async fn test_store() -> (SqliteCheckpointStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (SqliteCheckpointStore::new(pool), dir)
    }

    fn make_run(job_id: &str) -> RunRecord {
        RunRecord::new(Uuid::now_v7(), job_id, "1.0.0", TriggerKind::Invoke, json!({"message": "hi"}), Utc::now())
    }

    #[tokio::test]
    async fn test_create_and_get_run() {
        let (store, _dir) = test_store().await;
        let mut run = make_run("invoke-example-1");
        run.callback_url = Some("http://localhost/cb".to_string());

        assert!(store.create_run(&run).await.unwrap());
        assert!(!store.create_run(&run).await.unwrap(), "second create is a no-op");

        let fetched = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.job_id, "invoke-example-1");
        assert_eq!(fetched.payload, json!({"message": "hi"}));
        assert_eq!(fetched.status, RunStatus::Pending);
        assert_eq!(fetched.callback_url.as_deref(), Some("http://localhost/cb"));
        assert_eq!(
            format_datetime(&fetched.created_at),
            format_datetime(&run.created_at)
        );
    }

    #[tokio::test]
    async fn test_update_run_and_filters() {
        let (store, _dir) = test_store().await;
        let parent = make_run("parent");
        store.create_run(&parent).await.unwrap();

        let mut child = make_run("child");
        child.parent = Some(ParentLink {
            run_id: parent.id,
            step_key: "invoke".to_string(),
            index: 0,
            wait: true,
        });
        store.create_run(&child).await.unwrap();

        child.status = RunStatus::Failed;
        child.error = Some(ErrorInfo::new("Error", "Forced error"));
        child.completed_at = Some(Utc::now());
        store.update_run(&child).await.unwrap();

        let unfinished = store.list_unfinished_runs().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, parent.id);

        let failed = store.list_runs(Some(RunStatus::Failed), 10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].error.as_ref().unwrap().message, "Forced error");

        let children = store.list_child_runs(&parent.id).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].parent.as_ref().unwrap().step_key, "invoke");

        let missing = make_run("missing");
        assert!(matches!(store.update_run(&missing).await, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn test_insert_step_is_first_writer_wins() {
        let (store, _dir) = test_store().await;
        let run = make_run("job");
        store.create_run(&run).await.unwrap();

        let first = StepRecord::completed(run.id, "task-1", StepKind::Task, json!(1), Utc::now());
        let stored = store.insert_step(&first).await.unwrap();
        assert_eq!(stored.seq, 1);

        let second = StepRecord::completed(run.id, "task-1", StepKind::Task, json!(2), Utc::now());
        let stored = store.insert_step(&second).await.unwrap();
        assert_eq!(stored.output, Some(json!(1)));

        let other = StepRecord::pending(run.id, "wait-1", StepKind::Wait, Utc::now());
        assert_eq!(store.insert_step(&other).await.unwrap().seq, 2);

        let keys: Vec<String> = store
            .list_steps(&run.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step_key)
            .collect();
        assert_eq!(keys, vec!["task-1", "wait-1"]);
    }

    #[tokio::test]
    async fn test_concurrent_inserts_get_distinct_seq() {
        let (store, _dir) = test_store().await;
        let store = Arc::new(store);
        let run = make_run("job");
        store.create_run(&run).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            let run_id = run.id;
            handles.push(tokio::spawn(async move {
                let step = StepRecord::completed(run_id, format!("task.{i}"), StepKind::Task, json!(i), Utc::now());
                store.insert_step(&step).await.unwrap().seq
            }));
        }
        let mut seqs = Vec::new();
        for handle in handles {
            seqs.push(handle.await.unwrap());
        }
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=8).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_update_step_compare_and_set() {
        let (store, _dir) = test_store().await;
        let run = make_run("job");
        store.create_run(&run).await.unwrap();

        let mut pending = StepRecord::pending(run.id, "wait-1", StepKind::Wait, Utc::now());
        pending.wake_at = Some(Utc::now());
        store.insert_step(&pending).await.unwrap();

        let mut done = pending.clone();
        done.state = StepState::Completed;
        done.output = Some(json!(null));
        done.completed_at = Some(Utc::now());

        let stored = store.update_step(&done, StepState::Pending).await.unwrap();
        assert_eq!(stored.state, StepState::Completed);
        assert_eq!(stored.seq, 1);

        // The second writer sees the state already moved on.
        let mut failed = pending.clone();
        failed.state = StepState::Failed;
        let stored = store.update_step(&failed, StepState::Pending).await.unwrap();
        assert_eq!(stored.state, StepState::Completed);
    }

    #[tokio::test]
    async fn test_resolve_child_reports_last_slot_once() {
        let (store, _dir) = test_store().await;
        let run = make_run("parent");
        store.create_run(&run).await.unwrap();

        let mut step = StepRecord::pending(run.id, "batch", StepKind::Invocation, Utc::now());
        step.children = vec![Uuid::now_v7(), Uuid::now_v7()];
        step.child_results = vec![None, None];
        store.insert_step(&step).await.unwrap();

        let first = InvocationResult::success(step.children[0], json!("a"));
        let second = InvocationResult::failure(step.children[1], ErrorInfo::new("Error", "boom"));

        assert!(store.resolve_child(&run.id, "batch", 1, &second).await.unwrap().is_none());
        assert!(store.resolve_child(&run.id, "batch", 1, &second).await.unwrap().is_none());
        let joined = store.resolve_child(&run.id, "batch", 0, &first).await.unwrap().unwrap();
        assert!(joined.all_children_resolved());
        assert!(store.resolve_child(&run.id, "batch", 0, &first).await.unwrap().is_none());

        assert!(matches!(
            store.resolve_child(&run.id, "batch", 5, &first).await,
            Err(RepositoryError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_status_merges_and_bumps_version() {
        let (store, _dir) = test_store().await;
        let run = make_run("memes");
        store.create_run(&run).await.unwrap();

        store
            .apply_status(
                &run.id,
                "generating-memes",
                &StatusUpdate::new().label("Generating memes").state("loading"),
                Utc::now(),
            )
            .await
            .unwrap();

        let mut data = Map::new();
        data.insert("progress".to_string(), json!(1));
        let record = store
            .apply_status(
                &run.id,
                "generating-memes",
                &StatusUpdate::new().state("success").data(data),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(record.version, 2);

        let fetched = store.get_status(&run.id, "generating-memes").await.unwrap().unwrap();
        assert_eq!(fetched.label.as_deref(), Some("Generating memes"));
        assert_eq!(fetched.state, Some(StatusState::Success));
        assert_eq!(fetched.data.unwrap().get("progress"), Some(&json!(1)));
        assert_eq!(store.list_statuses(&run.id).await.unwrap().len(), 1);
    }
}
