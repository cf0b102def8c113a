//! HTTP callback delivery.
//!
//! POSTs a finished child run's `{id, jobId, ok, output|error}` to the
//! invocation's callback URL. A non-2xx answer is an error for the caller to
//! log; nothing is retried.

use std::time::Duration;

use futures_util::future::BoxFuture;
use tether_core::engine::callback::{CallbackError, CallbackNotifier};
use tether_types::invocation::CallbackPayload;

/// [`CallbackNotifier`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpCallbackNotifier {
    client: reqwest::Client,
}

impl HttpCallbackNotifier {
    /// Build a notifier whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

impl CallbackNotifier for HttpCallbackNotifier {
    fn notify(&self, url: &str, payload: CallbackPayload) -> BoxFuture<'static, Result<(), CallbackError>> {
        let request = self.client.post(url).json(&payload);
        let url = url.to_string();
        Box::pin(async move {
            let response = request
                .send()
                .await
                .map_err(|e| CallbackError::Request(format!("HTTP request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                return Err(CallbackError::Status(status.as_u16()));
            }
            tracing::debug!(url = %url, run_id = %payload.id, "callback delivered");
            Ok(())
        })
    }
}
