//! Checkpoint store trait definition (port) and in-process implementations.
//!
//! The trait defines the storage interface that the infrastructure layer
//! (tether-infra) implements. The core crate never depends on any specific
//! storage technology.

pub mod box_store;
pub mod checkpoint;
pub mod memory;

pub use box_store::BoxCheckpointStore;
pub use checkpoint::CheckpointStore;
pub use memory::InMemoryCheckpointStore;
