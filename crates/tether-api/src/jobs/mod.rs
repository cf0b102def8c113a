//! Demo jobs registered by the CLI.
//!
//! Credentials come from the environment: `OPENAI_API_KEY`,
//! `PERPLEXITY_API_KEY` and `REQUEST_BIN_URL` (callback target for
//! `invoke-example-2`). Jobs whose integration is missing still register;
//! their runs fail when they reach the call.

pub mod examples;
pub mod invoke;
pub mod schedules;

use std::sync::Arc;

use secrecy::SecretString;
use tether_core::engine::{Integration, JobDefinition};
use tether_infra::http::integration::HttpJsonIntegration;

use invoke::CompletionIntegrations;

/// Environment-derived settings for the demo jobs.
#[derive(Clone, Default)]
pub struct DemoConfig {
    pub integrations: CompletionIntegrations,
    pub callback_url: Option<String>,
}

impl DemoConfig {
    pub fn from_env() -> Self {
        let openai = env_secret("OPENAI_API_KEY").and_then(|key| {
            build_integration("openai", HttpJsonIntegration::openai(key))
        });
        let perplexity = env_secret("PERPLEXITY_API_KEY").and_then(|key| {
            build_integration("perplexity", HttpJsonIntegration::perplexity(key))
        });
        Self {
            integrations: CompletionIntegrations { openai, perplexity },
            callback_url: std::env::var("REQUEST_BIN_URL").ok().filter(|url| !url.is_empty()),
        }
    }
}

fn env_secret(name: &str) -> Option<SecretString> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .map(SecretString::from)
}

fn build_integration(
    id: &str,
    built: Result<HttpJsonIntegration, reqwest::Error>,
) -> Option<Arc<dyn Integration>> {
    match built {
        Ok(integration) => Some(Arc::new(integration)),
        Err(e) => {
            tracing::warn!(integration = id, error = %e, "failed to build integration client");
            None
        }
    }
}

/// Every demo job, ready for registration.
pub fn demo_jobs(config: &DemoConfig) -> Vec<JobDefinition> {
    vec![
        examples::auto_yield(),
        schedules::schedule_example(),
        invoke::invoke_example_1(),
        invoke::invoke_example_2(config.callback_url.clone()),
        invoke::completion_job(&config.integrations),
        invoke::batch_invoke_ai_example(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use serde_json::{Value, json};
    use tether_core::engine::{Engine, IntegrationError};
    use tether_types::invocation::{InvocationResult, InvokeOptions};
    use tether_types::run::RunStatus;
    use tether_types::status::StatusState;

    /// Answers every call with the request's prompt, or fails every call.
    struct FakeCompletions {
        fail: bool,
    }

    impl Integration for FakeCompletions {
        fn call(&self, _operation: &str, request: Value) -> BoxFuture<'static, Result<Value, IntegrationError>> {
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(IntegrationError::Request("HTTP 503: overloaded".to_string()));
                }
                Ok(json!({ "model": request["model"].clone(), "text": "ok" }))
            })
        }
    }

    fn engine(config: &DemoConfig) -> Engine {
        let mut builder = Engine::builder();
        for job in demo_jobs(config) {
            builder = builder.job(job).unwrap();
        }
        builder.build()
    }

    #[test]
    fn demo_job_ids_are_unique() {
        let jobs = demo_jobs(&DemoConfig::default());
        let mut ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), jobs.len());
    }

    #[tokio::test(start_paused = true)]
    async fn forced_error_fails_run_after_final_status() {
        let engine = engine(&DemoConfig::default());
        engine.start().await.unwrap();

        let handle = engine
            .invoke(
                invoke::INVOKE_EXAMPLE_1,
                json!({ "message": "hi", "forceError": true, "delay": 2 }),
                InvokeOptions::default(),
            )
            .await
            .unwrap();
        let run_id = handle.run_id;
        let result = handle.wait_for_completion().await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().message, "Forced error");

        let status = engine.get_status(run_id, "status-1").await.unwrap().unwrap();
        assert_eq!(status.label.as_deref(), Some("Generating memes"));
        assert_eq!(status.state, Some(StatusState::Success));
        assert_eq!(status.data.unwrap()["progress"], json!(1));
        assert_eq!(status.version, 2);

        let run = engine.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn auto_yield_records_a_task_and_random_per_iteration() {
        let engine = engine(&DemoConfig::default());
        engine.start().await.unwrap();

        let handles = engine
            .send_event("auto.yield.1", json!({ "timeout": 500, "iterations": 3 }))
            .await
            .unwrap();
        assert_eq!(handles.len(), 1);
        let handle = handles.into_iter().next().unwrap();
        let run_id = handle.run_id;
        let result = handle.wait_for_completion().await.unwrap();
        assert!(result.ok, "run failed: {:?}", result.error);
        assert_eq!(result.output, Some(json!({ "iterations": 3 })));

        let keys: Vec<String> = engine
            .list_steps(run_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step_key)
            .collect();
        assert_eq!(
            keys,
            vec!["initial-long-task", "random.0", "task.0", "random.1", "task.1", "random.2", "task.2"]
        );
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_example_runs_every_three_minutes() {
        let engine = engine(&DemoConfig::default());
        engine.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(185)).await;

        let runs = engine.list_runs(Some(RunStatus::Completed), 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].job_id, "schedule-example-1");
        let output = runs[0].output.clone().unwrap();
        assert_eq!(output["message"], "Hello World");
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn completion_without_integration_is_a_definition_error() {
        let engine = engine(&DemoConfig::default());
        engine.start().await.unwrap();

        let handle = engine
            .invoke(invoke::COMPLETION_JOB, json!({ "prompt": "hello" }), InvokeOptions::default())
            .await
            .unwrap();
        let result = handle.wait_for_completion().await.unwrap();
        assert!(!result.ok);
        assert_eq!(result.error.unwrap().name, "DefinitionError");
        engine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn batch_retries_failed_prompts_on_second_provider() {
        let config = DemoConfig {
            integrations: CompletionIntegrations {
                openai: Some(Arc::new(FakeCompletions { fail: true })),
                perplexity: Some(Arc::new(FakeCompletions { fail: false })),
            },
            callback_url: None,
        };
        let engine = engine(&config);
        engine.start().await.unwrap();

        let handle = engine
            .invoke("batch-invoke-ai-example", json!({}), InvokeOptions::default())
            .await
            .unwrap();
        let result = handle.wait_for_completion().await.unwrap();
        assert!(result.ok, "run failed: {:?}", result.error);

        let output = result.output.unwrap();
        let runs: Vec<InvocationResult> = serde_json::from_value(output["runs"].clone()).unwrap();
        let retried: Vec<InvocationResult> = serde_json::from_value(output["retried"].clone()).unwrap();
        assert_eq!(runs.len(), 5);
        assert!(runs.iter().all(|r| !r.ok));
        assert_eq!(retried.len(), 5);
        assert!(retried.iter().all(|r| r.ok));
        assert_eq!(retried[0].output.as_ref().unwrap()["model"], "mistral-7b-instruct");
        engine.shutdown().await;
    }
}
