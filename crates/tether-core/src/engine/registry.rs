//! Job registry: the explicit, process-wide set of job definitions.
//!
//! Built once at process start and shared by `Arc` with the dispatcher and
//! the scheduler. There is no ambient global client.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tether_types::trigger::TriggerSpec;

use super::job::JobDefinition;

/// Errors that can occur while registering jobs.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("job '{0}' is already registered")]
    Duplicate(String),

    #[error("job id must not be empty")]
    EmptyId,
}

/// Registry of job definitions keyed by job ID.
#[derive(Default)]
pub struct JobRegistry {
    jobs: DashMap<String, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Job IDs are unique.
    pub fn register(&self, job: JobDefinition) -> Result<(), RegistryError> {
        if job.id.trim().is_empty() {
            return Err(RegistryError::EmptyId);
        }
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(job.id)),
            Entry::Vacant(slot) => {
                tracing::info!(
                    job_id = %job.id,
                    version = %job.version,
                    trigger = %job.trigger.kind(),
                    enabled = job.enabled,
                    "job registered"
                );
                slot.insert(Arc::new(job));
                Ok(())
            }
        }
    }

    pub fn get(&self, job_id: &str) -> Option<Arc<JobDefinition>> {
        self.jobs.get(job_id).map(|j| Arc::clone(&j))
    }

    /// Jobs bound to the named application event, ordered by ID.
    pub fn jobs_for_event(&self, event_name: &str) -> Vec<Arc<JobDefinition>> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter(|j| matches!(&j.trigger, TriggerSpec::Event { name, .. } if name == event_name))
            .map(|j| Arc::clone(&j))
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    /// Interval-triggered jobs with their period in seconds, ordered by ID.
    pub fn interval_jobs(&self) -> Vec<(Arc<JobDefinition>, u64)> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .filter_map(|j| match j.trigger {
                TriggerSpec::Interval { seconds } => Some((Arc::clone(&j), seconds)),
                _ => None,
            })
            .collect();
        jobs.sort_by(|a, b| a.0.id.cmp(&b.0.id));
        jobs
    }

    /// All jobs ordered by ID.
    pub fn list(&self) -> Vec<Arc<JobDefinition>> {
        let mut jobs: Vec<_> = self.jobs.iter().map(|j| Arc::clone(&j)).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.len())
            .finish()
    }
}
