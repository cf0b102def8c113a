//! Durable job engine for Tether.
//!
//! This crate holds the engine components (run scheduler, task executor,
//! timer service, invocation coordinator, status channel, trigger dispatcher)
//! and the checkpoint store "port" that the infrastructure layer implements.
//! It depends only on `tether-types`, never on `tether-infra` or any
//! database/IO crate.

pub mod engine;
pub mod event;
pub mod repository;
