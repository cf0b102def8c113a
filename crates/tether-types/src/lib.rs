//! Shared domain types for Tether.
//!
//! This crate contains the data model of the durable job engine: runs, steps,
//! invocations, triggers, status records, retry policies, lifecycle events,
//! and the error types shared between the engine and its storage backends.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod invocation;
pub mod retry;
pub mod run;
pub mod status;
pub mod step;
pub mod trigger;
