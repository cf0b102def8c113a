//! Event-triggered demo: a long first task followed by a run of short ones.

use std::time::Duration;

use serde_json::{Value, json};
use tether_core::engine::{JobDefinition, JobError, JobIo};
use tether_types::trigger::{FieldSchema, PayloadSchema, TriggerSpec};

pub fn auto_yield() -> JobDefinition {
    let trigger = TriggerSpec::event("auto.yield.1").with_schema(
        PayloadSchema::new()
            .field("timeout", FieldSchema::integer().with_default(json!(0)))
            .field("iterations", FieldSchema::integer().with_default(json!(0))),
    );
    JobDefinition::new("auto-yield-1", "Auto Yield 1", "1.0.0", trigger, run)
}

async fn run(payload: Value, io: JobIo) -> Result<Value, JobError> {
    let timeout = payload["timeout"].as_u64().unwrap_or(0);
    let iterations = payload["iterations"].as_u64().unwrap_or(0);

    io.run_task("initial-long-task", || async move {
        tokio::time::sleep(Duration::from_millis(timeout)).await;
        Ok::<_, anyhow::Error>(json!({ "message": "initial-long-task" }))
    })
    .await?;

    for i in 0..iterations {
        // Between 250 and 1250 ms, drawn once per iteration.
        let random = 250 + (io.random(&format!("random.{i}")).await? * 1000.0) as u64;
        io.run_task(&format!("task.{i}"), || async move {
            tokio::time::sleep(Duration::from_millis(random)).await;
            Ok::<_, anyhow::Error>(json!({ "message": format!("task.{i}"), "random": random }))
        })
        .await?;
    }

    Ok(json!({ "iterations": iterations }))
}
