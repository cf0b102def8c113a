//! The durable execution engine.
//!
//! A run's body is replayed from the top on every drive. Steps already
//! recorded in the checkpoint store short-circuit to their recorded outcome;
//! an unresolved step suspends the drive until a timer or a child run
//! resumes it through the scheduler.

pub mod callback;
pub mod checkpoint;
pub mod clock;
pub mod executor;
pub mod integration;
pub mod invocation;
pub mod io;
pub mod job;
pub mod launcher;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod status;
pub mod trigger;

pub use callback::{CallbackError, CallbackNotifier};
pub use checkpoint::{CheckpointError, CheckpointManager};
pub use clock::{TimerError, TimerService};
pub use integration::{Integration, IntegrationError, IntegrationSet};
pub use io::{JobIo, RunLogger, StatusHandle};
pub use job::{JobDefinition, JobError, JobHandler};
pub use launcher::RunHandle;
pub use registry::{JobRegistry, RegistryError};
pub use runtime::{Engine, EngineBuilder, EngineError};
pub use scheduler::{ResumeEvent, RunState, SchedulerError};
pub use trigger::DispatchError;
