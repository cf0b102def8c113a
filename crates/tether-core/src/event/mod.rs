//! Lifecycle event bus for run observers.
//!
//! Provides an `EventBus` that distributes `RunEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel, plus a registry of
//! `RunObserver` handlers keyed by event kind.

pub mod bus;

pub use bus::{EventBus, RunObserver};
