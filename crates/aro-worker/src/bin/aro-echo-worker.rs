//! Reference worker used by the runtime's process tests.
//!
//! Actions:
//! - `echo`: returns its input
//! - `sleep`: waits `ms` milliseconds
//! - `fail`: reports an error with the requested `code`
//! - `crash`: exits without answering
//! - `Ping`: handler for the `Ping` event
//!
//! Qualifier `reverse` reverses strings and lists.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

use std::time::Duration;

use aro_telemetry::{LogConfig, setup_logging};
use aro_worker::{ActionError, ActionInfo, QualifierInfo, Worker};
use serde_json::{Value, json};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let level = std::env::var("ARO_WORKER_LOG").unwrap_or_else(|_| "warn".into());
    setup_logging(&LogConfig::for_worker(level))?;

    Worker::new("echo", env!("CARGO_PKG_VERSION"))
        .action(ActionInfo::new("echo").verb("repeat"), Ok)
        .action(ActionInfo::new("sleep").service_only(), |input| {
            let ms = input["ms"].as_u64().unwrap_or(0);
            std::thread::sleep(Duration::from_millis(ms));
            Ok(json!({ "slept_ms": ms }))
        })
        .action(ActionInfo::new("fail").service_only(), |input| {
            let code = input["code"].as_str().unwrap_or("general");
            Err(ActionError::new("requested failure")
                .with_code(code)
                .with_detail(input))
        })
        .action(ActionInfo::new("crash").service_only(), |input| {
            let status = input["status"]
                .as_i64()
                .and_then(|s| i32::try_from(s).ok())
                .unwrap_or(3);
            std::process::exit(status)
        })
        .qualifier(
            QualifierInfo::new("reverse")
                .input_type("String")
                .input_type("List")
                .description("Reverse a string or list"),
            |value, _| match value {
                Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
                Value::Array(mut items) => {
                    items.reverse();
                    Ok(Value::Array(items))
                },
                other => Err(ActionError::invalid_arguments(format!(
                    "cannot reverse {other}"
                ))),
            },
        )
        .action(ActionInfo::new("Ping").service_only(), |input| {
            Ok(json!({ "pong": input }))
        })
        .event("Ping")
        .run()
        .await?;
    Ok(())
}
