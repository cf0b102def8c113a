//! Engine assembly: wires the store, timer, scheduler, dispatcher and
//! coordinator together and exposes the host-facing surface.

use std::sync::Arc;

use serde_json::Value;
use tether_types::config::EngineConfig;
use tether_types::event::{RunEvent, RunEventKind};
use tether_types::invocation::InvokeOptions;
use tether_types::run::{RunRecord, RunStatus};
use tether_types::status::StatusRecord;
use tether_types::step::StepRecord;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::event::{EventBus, RunObserver};
use crate::repository::{BoxCheckpointStore, InMemoryCheckpointStore};

use super::callback::CallbackNotifier;
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::clock::TimerService;
use super::invocation::InvocationCoordinator;
use super::job::JobDefinition;
use super::launcher::{RunHandle, RunLauncher};
use super::registry::{JobRegistry, RegistryError};
use super::scheduler::{ResumeSender, RunScheduler, SchedulerCommand, SchedulerError};
use super::status::StatusChannel;
use super::trigger::{DispatchError, TriggerDispatcher};

/// Errors raised by engine lifecycle operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine is already started")]
    AlreadyStarted,

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

// ---------------------------------------------------------------------------
// EngineBuilder
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    registry: JobRegistry,
    store: Option<BoxCheckpointStore>,
    notifier: Option<Arc<dyn CallbackNotifier>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Checkpoint store to use. Defaults to an in-memory store.
    pub fn store(mut self, store: BoxCheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn CallbackNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Register a job definition.
    pub fn job(self, job: JobDefinition) -> Result<Self, RegistryError> {
        self.registry.register(job)?;
        Ok(self)
    }

    pub fn build(self) -> Engine {
        let store = self
            .store
            .unwrap_or_else(|| BoxCheckpointStore::new(InMemoryCheckpointStore::new()));
        let registry = Arc::new(self.registry);
        let checkpoint = Arc::new(CheckpointManager::new(store));
        let events = EventBus::new(self.config.event_buffer);
        let (sender, receiver) = ResumeSender::channel();
        let timer = Arc::new(TimerService::new(sender.clone()));

        let launcher = Arc::new(RunLauncher::new(
            Arc::clone(&checkpoint),
            Arc::clone(&timer),
            events.clone(),
            sender.clone(),
        ));
        let dispatcher = Arc::new(TriggerDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&launcher),
            Arc::clone(&timer),
        ));
        let mut coordinator = InvocationCoordinator::new(
            Arc::clone(&checkpoint),
            Arc::clone(&timer),
            events.clone(),
            Arc::clone(&dispatcher),
            sender.clone(),
        )
        .with_max_batch_size(self.config.max_batch_size);
        if let Some(notifier) = self.notifier {
            coordinator = coordinator.with_notifier(notifier);
        }
        let statuses = Arc::new(StatusChannel::new(
            Arc::clone(&checkpoint),
            Arc::clone(&timer),
            events.clone(),
        ));
        let scheduler = Arc::new(RunScheduler::new(
            Arc::clone(&registry),
            Arc::clone(&checkpoint),
            Arc::clone(&timer),
            events.clone(),
            launcher,
            Arc::new(coordinator),
            Arc::clone(&statuses),
            sender.clone(),
        ));

        Engine {
            config: self.config,
            registry,
            checkpoint,
            timer,
            events,
            dispatcher,
            statuses,
            scheduler,
            sender,
            receiver: Mutex::new(Some(receiver)),
            worker: Mutex::new(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A running job engine.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<JobRegistry>,
    checkpoint: Arc<CheckpointManager>,
    timer: Arc<TimerService>,
    events: EventBus,
    dispatcher: Arc<TriggerDispatcher>,
    statuses: Arc<StatusChannel>,
    scheduler: Arc<RunScheduler>,
    sender: ResumeSender,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SchedulerCommand>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Start the scheduler loop and interval triggers, then recover
    /// unfinished runs if configured to.
    pub async fn start(&self) -> Result<(), EngineError> {
        let receiver = self.receiver.lock().await.take().ok_or(EngineError::AlreadyStarted)?;
        *self.worker.lock().await = Some(self.scheduler.spawn(receiver));

        let intervals = self.dispatcher.start_interval_triggers()?;
        let recovered = if self.config.recover_on_start {
            self.scheduler.recover().await?
        } else {
            0
        };
        tracing::info!(
            jobs = self.registry.len(),
            intervals,
            recovered,
            "engine started"
        );
        Ok(())
    }

    /// Stop timers and the scheduler loop. Runs in flight stay recorded as
    /// unfinished and are picked up by the next `recover`.
    pub async fn shutdown(&self) {
        self.timer.shutdown();
        self.sender.shutdown();
        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "scheduler loop ended abnormally");
            }
        }
        tracing::info!("engine stopped");
    }

    // -----------------------------------------------------------------------
    // Triggers
    // -----------------------------------------------------------------------

    /// Deliver a named application event.
    pub async fn send_event(&self, name: &str, payload: Value) -> Result<Vec<RunHandle>, DispatchError> {
        self.dispatcher.dispatch_event(name, payload).await
    }

    /// Invoke an invocation-triggered job.
    pub async fn invoke(&self, job_id: &str, payload: Value, options: InvokeOptions) -> Result<RunHandle, DispatchError> {
        self.dispatcher.invoke(job_id, payload, options).await
    }

    /// Re-drive every unfinished run.
    pub async fn recover(&self) -> Result<usize, SchedulerError> {
        self.scheduler.recover().await
    }

    // -----------------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------------

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, CheckpointError> {
        self.checkpoint.get_run(run_id).await
    }

    pub async fn list_runs(&self, status: Option<RunStatus>, limit: u32) -> Result<Vec<RunRecord>, CheckpointError> {
        self.checkpoint.list_runs(status, limit).await
    }

    pub async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, CheckpointError> {
        self.checkpoint.list_steps(run_id).await
    }

    pub async fn list_child_runs(&self, run_id: Uuid) -> Result<Vec<RunRecord>, CheckpointError> {
        self.checkpoint.list_child_runs(run_id).await
    }

    pub async fn get_status(&self, run_id: Uuid, key: &str) -> Result<Option<StatusRecord>, CheckpointError> {
        self.statuses.get(run_id, key).await
    }

    pub async fn list_statuses(&self, run_id: Uuid) -> Result<Vec<StatusRecord>, CheckpointError> {
        self.statuses.list(run_id).await
    }

    pub async fn watch_status(&self, run_id: Uuid, key: &str) -> Result<watch::Receiver<StatusRecord>, CheckpointError> {
        self.statuses.watch(run_id, key).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle events
    // -----------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn observe(&self, kind: RunEventKind, observer: Arc<dyn RunObserver>) {
        self.events.register(kind, observer);
    }

    // -----------------------------------------------------------------------
    // Components
    // -----------------------------------------------------------------------

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<RunScheduler> {
        &self.scheduler
    }

    pub fn checkpoint(&self) -> &Arc<CheckpointManager> {
        &self.checkpoint
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("jobs", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
