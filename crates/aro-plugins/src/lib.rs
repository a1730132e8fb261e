//! Plugin runtime core for ARO.
//!
//! Discovers plugin packages, orders them by their dependencies, loads
//! their providers and routes calls into them through one invocation
//! contract:
//!
//! - [`PluginDescriptor`]: Parsed and validated `plugin.toml`
//! - [`resolve`] / [`resolve_lenient`]: Deterministic dependency ordering with cycle detection
//! - [`PluginHost`]: Common surface of compiled-library, subprocess and declarative providers
//! - [`StructuredError`] / [`InvocationResult`]: The call contract shared by every transport
//! - [`Registry`]: Verbs, `service:method` calls, qualifiers and event subscriptions
//! - [`SystemObjectTable`]: Capability-gated `read` / `write` / `list` objects
//! - [`Session`]: The load phase and the frozen tables it produces
//!
//! # Ownership across the library boundary
//!
//! Every string a compiled plugin returns is wrapped in a
//! [`PluginBuffer`](host::native::PluginBuffer) and handed back to the
//! plugin's own free function exactly once. A per-library
//! [`BufferLedger`](host::native::BufferLedger) rejects double frees and
//! reports buffers that were never released.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod bridge;
pub mod discovery;
pub mod error;
pub mod host;
pub mod manifest;
pub mod objects;
pub mod plugin;
pub mod registry;
pub mod resolver;
pub mod runtime;

pub use bridge::{ErrorCode, InvocationResult, StructuredError};
pub use discovery::{Discovery, MANIFEST_FILE_NAME, discover_manifests};
pub use error::{PluginError, PluginResult, ResolutionError};
pub use host::{
    CompiledLibraryHost, DeclarativeFileHost, HostServices, PluginHost, SubprocessHost,
    UnitExecutor, create_host,
};
pub use manifest::{
    ActionRole, ActionSpec, EventSubscription, HostKind, PluginDescriptor, PluginMetadata,
    ProviderKind, ProviderSpec, QualifierSpec, SystemObjectSpec, normalize_name,
};
pub use objects::{Capability, CapabilitySet, ObjectHandle, SystemObject, SystemObjectTable};
pub use plugin::{PluginId, PluginState};
pub use registry::{BuiltinAction, Registry, RegistryBuilder, ServiceCall};
pub use resolver::{DependencyGraph, resolve, resolve_lenient};
pub use runtime::{EventOutcome, LoadFailure, LoadedPlugin, Session, SessionBuilder};
