//! Infrastructure layer for Tether.
//!
//! Implements the ports defined in `tether-core`: the SQLite checkpoint
//! store, the HTTP callback notifier and an HTTP JSON integration, plus the
//! data-directory and `config.toml` resolution used by the binary.

pub mod config;
pub mod http;
pub mod sqlite;
