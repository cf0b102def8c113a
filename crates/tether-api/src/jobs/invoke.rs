//! Invocation demos: a status-reporting child job, a parent that invokes it
//! three ways, a completion job backed by an integration, and a batch fan-out
//! over that completion job.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tether_core::engine::{Integration, JobDefinition, JobError, JobIo};
use tether_types::invocation::{InvocationResult, InvokeOptions};
use tether_types::retry::{BackgroundCallOptions, RetryPolicy};
use tether_types::status::StatusUpdate;
use tether_types::trigger::{FieldSchema, PayloadSchema, TriggerSpec};

pub const INVOKE_EXAMPLE_1: &str = "invoke-example-1";
pub const COMPLETION_JOB: &str = "openai-job";

const JSON_URL: &str = "https://jsonhero.io/j/PjHo1o5MVeH4.json";

const MEME_URL: &str = "https://media.giphy.com/media/v1.Y2lkPTc5MGI3NjExZnZoMndsdWh0MmhvY2kyaDF6YjZjZzg1ZGsxdnhhYm13a3Q1Y3lkbyZlcD12MV9pbnRlcm5hbF9naWZfYnlfaWQmY3Q9Zw/13HgwGsXF0aiGY/giphy.gif";

const PROMPTS: [&str; 5] = [
    "Advantages of quantum computing over classical computing",
    "The ethical implications of advanced artificial intelligence",
    "Design a thought experiment highlighting the paradoxes in quantum mechanics",
    "Explain the Fermi Paradox, its potential solutions, and implications for humanity",
    "Analyze Shakespeare's use of iambic pentameter in his plays",
];

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// invoke-example-1
// ---------------------------------------------------------------------------

pub fn invoke_example_1() -> JobDefinition {
    let trigger = TriggerSpec::invoke().with_schema(
        PayloadSchema::new()
            .field("message", FieldSchema::string())
            .field("forceError", FieldSchema::boolean().with_default(json!(false)))
            .field("delay", FieldSchema::number().with_default(json!(5))),
    );
    JobDefinition::new(INVOKE_EXAMPLE_1, "Invoke Example 1", "1.0.0", trigger, run_invoke_example_1)
        .enabled(true)
}

async fn run_invoke_example_1(payload: Value, io: JobIo) -> Result<Value, JobError> {
    let generating_memes = io
        .create_status(
            "status-1",
            StatusUpdate::new()
                .label("Generating memes")
                .state("loading")
                .data(data(json!({ "progress": 0.1 }))),
        )
        .await?;

    io.run_task("task-1", || async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<_, anyhow::Error>(Value::Null)
    })
    .await?;

    let delay = payload["delay"].as_f64().unwrap_or(5.0).max(0.0);
    io.wait("wait-1", Duration::from_secs_f64(delay)).await?;

    io.run_task("task-2", || async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        Ok::<_, anyhow::Error>(json!([{ "hello": "there", "ts": chrono::Utc::now() }]))
    })
    .await?;

    // No label: the existing one is kept. Data is replaced wholesale.
    generating_memes
        .update(
            "middle-generation",
            StatusUpdate::new()
                .state("success")
                .data(data(json!({ "progress": 1, "urls": [MEME_URL] }))),
        )
        .await?;

    if payload["forceError"].as_bool().unwrap_or(false) {
        return Err(JobError::failed("Forced error"));
    }

    io.run_task("fetch-json", || async {
        let response = reqwest::get(JSON_URL).await?.error_for_status()?;
        Ok::<Value, anyhow::Error>(response.json::<Value>().await?)
    })
    .await
}

// ---------------------------------------------------------------------------
// invoke-example-2
// ---------------------------------------------------------------------------

/// Invokes `invoke-example-1` fire-and-forget, fire-and-forget with a
/// callback (when `callback_url` is set), and invoke-and-wait with a forced
/// error.
pub fn invoke_example_2(callback_url: Option<String>) -> JobDefinition {
    JobDefinition::new(
        "invoke-example-2",
        "Invoke Example 2",
        "1.0.0",
        TriggerSpec::invoke(),
        move |_payload: Value, io: JobIo| {
            let callback_url = callback_url.clone();
            async move {
                io.invoke(
                    "invoke",
                    INVOKE_EXAMPLE_1,
                    json!({ "message": "Hello World 1" }),
                    InvokeOptions::default(),
                )
                .await?;

                let options = match callback_url {
                    Some(url) => InvokeOptions::with_callback(url),
                    None => InvokeOptions::default(),
                };
                io.invoke(
                    "invoke-with-url",
                    INVOKE_EXAMPLE_1,
                    json!({ "message": "Hello World 2" }),
                    options,
                )
                .await?;

                let result = io
                    .invoke_and_wait_for_completion(
                        "invoke-and-wait",
                        INVOKE_EXAMPLE_1,
                        json!({ "message": "Hello World 3", "forceError": true }),
                    )
                    .await?;

                if result.ok {
                    io.logger().info("Invoking job worked!");
                } else {
                    io.logger().error("Invoking job failed!");
                }
                serde_json::to_value(result).map_err(|e| JobError::Serialization(e.to_string()))
            }
        },
    )
    .enabled(true)
}

// ---------------------------------------------------------------------------
// openai-job
// ---------------------------------------------------------------------------

/// Completion integrations for [`completion_job`]. A missing integration
/// fails runs that need it with a definition error.
#[derive(Clone, Default)]
pub struct CompletionIntegrations {
    pub openai: Option<Arc<dyn Integration>>,
    pub perplexity: Option<Arc<dyn Integration>>,
}

fn completion_options() -> BackgroundCallOptions {
    // 30 s overall, up to 3 retries.
    BackgroundCallOptions::new(30_000, Some(RetryPolicy::new(3, 1000, 2.0)))
}

/// Chat completion through OpenAI for `gpt-3.5-turbo`, plain completion
/// through Perplexity for any other model.
pub fn completion_job(integrations: &CompletionIntegrations) -> JobDefinition {
    let trigger = TriggerSpec::invoke().with_schema(
        PayloadSchema::new()
            .field("model", FieldSchema::string().with_default(json!("gpt-3.5-turbo")))
            .field("prompt", FieldSchema::string()),
    );
    let mut job = JobDefinition::new(COMPLETION_JOB, "OpenAI Job", "1.0.0", trigger, run_completion)
        .enabled(true);
    if let Some(openai) = &integrations.openai {
        job = job.with_integration("openai", Arc::clone(openai));
    }
    if let Some(perplexity) = &integrations.perplexity {
        job = job.with_integration("perplexity", Arc::clone(perplexity));
    }
    job
}

async fn run_completion(payload: Value, io: JobIo) -> Result<Value, JobError> {
    let model = payload["model"].as_str().unwrap_or("gpt-3.5-turbo").to_string();
    let prompt = payload["prompt"].clone();

    if model == "gpt-3.5-turbo" {
        io.background_call(
            "background-chat-completion",
            "openai",
            "chat.completions",
            json!({
                "model": model,
                "messages": [{ "role": "user", "content": prompt }],
            }),
            completion_options(),
        )
        .await
    } else {
        io.background_call(
            "background-completion",
            "perplexity",
            "completions",
            json!({ "model": model, "prompt": prompt }),
            completion_options(),
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// batch-invoke-ai-example
// ---------------------------------------------------------------------------

/// Fans the prompts out to [`completion_job`] on OpenAI, then retries the
/// failed ones on Perplexity.
pub fn batch_invoke_ai_example() -> JobDefinition {
    JobDefinition::new(
        "batch-invoke-ai-example",
        "Batch Invoke OpenAI Example",
        "1.0.0",
        TriggerSpec::invoke(),
        run_batch_invoke,
    )
}

async fn run_batch_invoke(_payload: Value, io: JobIo) -> Result<Value, JobError> {
    let runs = io
        .batch_invoke_and_wait_for_completion(
            "batch-invoke-and-wait",
            COMPLETION_JOB,
            PROMPTS
                .iter()
                .map(|prompt| json!({ "model": "gpt-3.5-turbo", "prompt": prompt }))
                .collect(),
        )
        .await?;

    io.logger().info(&format!("Got {} runs", runs.len()));

    // Results line up with PROMPTS.
    let failed: Vec<&str> = runs
        .iter()
        .zip(PROMPTS)
        .filter(|(run, _)| !run.ok)
        .map(|(_, prompt)| prompt)
        .collect();

    let retried: Vec<InvocationResult> = io
        .batch_invoke_and_wait_for_completion(
            "batch-invoke-and-wait-retry",
            COMPLETION_JOB,
            failed
                .iter()
                .map(|prompt| json!({ "model": "mistral-7b-instruct", "prompt": prompt }))
                .collect(),
        )
        .await?;

    let still_failed = retried.iter().filter(|run| !run.ok).count();
    if still_failed > 0 {
        io.logger().warn(&format!("{still_failed} prompts failed on both providers"));
    }

    Ok(json!({
        "runs": runs,
        "retried": retried,
    }))
}
