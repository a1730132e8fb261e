//! SDK for ARO plugin workers.
//!
//! A worker is a separate process the runtime talks to over stdin/stdout,
//! one JSON object per line. This crate answers the handshake, routes
//! `execute` and `qualifier` requests to registered handlers and exits
//! cleanly on `shutdown`. Logs go to stderr so they never mix with
//! responses.
//!
//! # Example
//!
//! ```rust,no_run
//! use aro_worker::{ActionError, ActionInfo, Worker};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), aro_worker::WorkerError> {
//! Worker::new("greeter", "1.0.0")
//!     .action(ActionInfo::new("greet").role("outbound"), |input| {
//!         let name = input["name"]
//!             .as_str()
//!             .ok_or_else(|| ActionError::invalid_arguments("name is required"))?;
//!         Ok(json!({ "greeting": format!("hello, {name}") }))
//!     })
//!     .run()
//!     .await
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
pub mod protocol;
mod worker;

pub use error::{ActionError, ActionResult, WorkerError, WorkerResult};
pub use worker::{ActionInfo, QualifierInfo, Worker};
