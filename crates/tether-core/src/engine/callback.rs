//! Outbound notification port for invocation callbacks.
//!
//! When an invocation carries a `callbackUrl`, the child's terminal result is
//! POSTed there on a best-effort basis. Delivery failures are logged by the
//! caller and never affect the child run.

use futures_util::future::BoxFuture;
use serde_json::Value;
use tether_types::invocation::CallbackPayload;
use tether_types::run::{RunRecord, RunStatus};

/// Errors that can occur while delivering a callback.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallbackError {
    #[error("callback request failed: {0}")]
    Request(String),

    #[error("callback endpoint returned status {0}")]
    Status(u16),
}

/// Delivers terminal results to callback URLs.
pub trait CallbackNotifier: Send + Sync {
    fn notify(&self, url: &str, payload: CallbackPayload) -> BoxFuture<'static, Result<(), CallbackError>>;
}

/// Callback body for a terminal run. `None` while the run is unfinished.
pub fn callback_payload(run: &RunRecord) -> Option<CallbackPayload> {
    let ok = match run.status {
        RunStatus::Completed => true,
        RunStatus::Failed => false,
        _ => return None,
    };
    Some(CallbackPayload {
        id: run.id,
        job_id: run.job_id.clone(),
        ok,
        output: if ok {
            Some(run.output.clone().unwrap_or(Value::Null))
        } else {
            None
        },
        error: if ok { None } else { run.error.clone() },
    })
}
