//! Logging and call tracing for the ARO plugin runtime.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats and targets
//! - A per-call context for correlating plugin invocations
//!
//! # Example
//!
//! ```rust,no_run
//! use aro_telemetry::{CallContext, CallGuard, LogConfig, LogFormat, setup_logging};
//!
//! # fn main() -> Result<(), aro_telemetry::TelemetryError> {
//! let config = LogConfig::new("debug")
//!     .with_format(LogFormat::Pretty)
//!     .with_directive("aro_plugins::host=trace");
//! setup_logging(&config)?;
//!
//! let _guard = CallGuard::new(CallContext::new("execute").with_plugin("csv"));
//! tracing::info!("dispatching");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod context;
mod error;
mod logging;

pub use context::{CallContext, CallGuard};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
