//! Integration capabilities injected into jobs.
//!
//! An integration is an opaque capability object: the engine only knows it
//! can `call(operation, request)` and get JSON back. Concrete adapters (HTTP
//! completion APIs and the like) live outside the core crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

/// Errors reported by an integration call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IntegrationError {
    /// The remote side rejected or failed the request.
    #[error("integration request failed: {0}")]
    Request(String),

    /// The response could not be interpreted.
    #[error("invalid integration response: {0}")]
    InvalidResponse(String),

    /// The integration does not support the operation.
    #[error("unsupported operation '{0}'")]
    UnsupportedOperation(String),
}

/// A capability object a job can call through `background_call`.
pub trait Integration: Send + Sync {
    fn call(&self, operation: &str, request: Value) -> BoxFuture<'static, Result<Value, IntegrationError>>;
}

/// Integrations available to one job, keyed by ID.
#[derive(Clone, Default)]
pub struct IntegrationSet {
    inner: BTreeMap<String, Arc<dyn Integration>>,
}

impl IntegrationSet {
    pub fn insert(&mut self, id: impl Into<String>, integration: Arc<dyn Integration>) {
        self.inner.insert(id.into(), integration);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Integration>> {
        self.inner.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.inner.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for IntegrationSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.inner.keys()).finish()
    }
}
