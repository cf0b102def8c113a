//! Interval-triggered demo, fired every three minutes.

use std::time::Duration;

use serde_json::{Value, json};
use tether_core::engine::{JobDefinition, JobError, JobIo};
use tether_types::trigger::TriggerSpec;

pub fn schedule_example() -> JobDefinition {
    JobDefinition::new(
        "schedule-example-1",
        "Schedule Example 1",
        "1.0.0",
        TriggerSpec::interval(60 * 3),
        run,
    )
}

async fn run(_payload: Value, io: JobIo) -> Result<Value, JobError> {
    let value = io.random("random-native").await?;

    let output: Value = io
        .run_task("task-example-1", || async move {
            Ok::<_, anyhow::Error>(json!({ "message": "Hello World", "value": value }))
        })
        .await?;

    io.wait("wait-1", Duration::from_secs(1)).await?;

    io.logger().info("Hello World");
    Ok(output)
}
