//! Invocation types: the causal edge from a parent run's step to a child run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::step::ErrorInfo;

/// Options accepted by an invocation request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeOptions {
    /// Target for a best-effort POST of the child's terminal result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl InvokeOptions {
    pub fn with_callback(url: impl Into<String>) -> Self {
        Self {
            callback_url: Some(url.into()),
        }
    }
}

/// Terminal outcome of a child run as seen by its parent.
///
/// A child failure never throws into the parent: it is reported here with
/// `ok = false` and the recorded error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResult {
    pub ok: bool,
    /// Child run ID.
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl InvocationResult {
    pub fn success(id: Uuid, output: Value) -> Self {
        Self {
            ok: true,
            id,
            output: Some(output),
            error: None,
        }
    }

    pub fn failure(id: Uuid, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            output: None,
            error: Some(error),
        }
    }
}

/// Body of the outbound callback POST sent when an invoked run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    pub id: Uuid,
    pub job_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}
