//! Drives the reference worker binary through the plugin runtime.

#![cfg(unix)]

use std::path::Path;

use aro_config::{Config, LoadFailurePolicy};
use aro_plugins::{ErrorCode, PluginState, Session, SessionBuilder};
use serde_json::json;

const WORKER: &str = env!("CARGO_BIN_EXE_aro-echo-worker");

fn write_plugin(root: &Path, extra: &str) {
    let dir = root.join("echo");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("plugin.toml"),
        format!(
            "name = \"echo\"\nversion = \"1.0.0\"\n\n[[provides]]\ntype = \"subprocess\"\ncommand = \"{WORKER}\"\ncall_timeout_ms = 500\n{extra}"
        ),
    )
    .unwrap();
}

async fn session(root: &Path) -> Session {
    let mut config = Config::default();
    config.plugins.directories = vec![root.to_path_buf()];
    config.plugins.load_failure_policy = LoadFailurePolicy::Abort;
    SessionBuilder::new(config).build().await.unwrap()
}

#[tokio::test]
async fn test_handshake_registers_worker_exports() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "");
    let mut session = session(dir.path()).await;

    assert_eq!(session.state("echo"), PluginState::Loaded);
    let registry = session.registry();
    assert!(registry.resolve_action("echo", None).is_ok());
    assert!(registry.resolve_action("repeat", None).is_ok());
    // Service-only actions get no verb.
    assert!(registry.resolve_action("sleep", None).is_err());
    assert!(registry.resolve_service("echo:sleep").is_ok());
    assert!(registry.resolve_qualifier("reverse").is_ok());

    session.shutdown().await;
    assert_eq!(session.state("echo"), PluginState::Unloaded);
}

#[tokio::test]
async fn test_calls_round_trip_through_the_process() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "");
    let mut session = session(dir.path()).await;

    let out = session
        .invoke_action("repeat", None, json!({ "text": "hi" }))
        .await
        .unwrap();
    assert_eq!(out, json!({ "text": "hi" }));

    let reversed = session
        .apply_qualifier("reverse", json!([1, 2, 3]), "List")
        .await
        .unwrap();
    assert_eq!(reversed, json!([3, 2, 1]));

    let err = session
        .call_service("echo:fail", json!({ "code": "rate-limited" }))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::RateLimited);
    assert_eq!(err.message, "requested failure");

    let outcomes = session.dispatch_event("Ping", &json!(7)).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].result.as_ref().unwrap(), &json!({ "pong": 7 }));

    session.shutdown().await;
}

#[tokio::test]
async fn test_slow_call_times_out_without_blocking_others() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "");
    let mut session = session(dir.path()).await;

    let (slow, fast) = tokio::join!(
        session.call_service("echo:sleep", json!({ "ms": 2000 })),
        session.invoke_action("echo", None, json!(1)),
    );
    assert_eq!(slow.unwrap_err().code, ErrorCode::Timeout);
    assert_eq!(fast.unwrap(), json!(1));

    session.shutdown().await;
}

#[tokio::test]
async fn test_crash_surfaces_as_host_terminated() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "");
    let mut session = session(dir.path()).await;

    let err = session
        .call_service("echo:crash", json!({ "status": 4 }))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::HostTerminated);
    // No restart policy: the plugin stays down.
    let err = session.invoke_action("echo", None, json!(1)).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::HostTerminated);

    session.shutdown().await;
}

#[tokio::test]
async fn test_restart_policy_brings_worker_back() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "restart = { policy = \"on_failure\", max_retries = 1 }\n");
    let mut session = session(dir.path()).await;

    assert_eq!(
        session
            .call_service("echo:crash", json!({}))
            .await
            .unwrap_err()
            .code,
        ErrorCode::HostTerminated
    );
    // The next call starts a fresh worker.
    let out = session.invoke_action("echo", None, json!("again")).await.unwrap();
    assert_eq!(out, json!("again"));

    session.shutdown().await;
}
