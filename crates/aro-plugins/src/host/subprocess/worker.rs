//! One worker process and the tasks that serve it.
//!
//! All requests go through a single writer task fed by an mpsc queue, so
//! lines never interleave on the child's stdin. A reader task matches
//! response lines to waiting callers by correlation id; responses may
//! arrive in any order. An exit monitor owns the child and fails every
//! in-flight call with `host-terminated` the moment the process goes away.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::protocol::{METHOD_SHUTDOWN, Request, Response};
use crate::bridge::{InvocationResult, StructuredError};
use crate::plugin::PluginId;

/// Requests queued for the writer task.
const WRITE_QUEUE_DEPTH: usize = 64;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<InvocationResult>>>>;

/// A running worker process.
pub(crate) struct Worker {
    plugin: PluginId,
    outbound: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    consecutive_timeouts: AtomicU32,
    max_consecutive_timeouts: u32,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    exited: watch::Receiver<bool>,
}

impl Worker {
    /// Spawn `command` and start the writer, reader and exit monitor.
    pub(crate) fn spawn(
        plugin: PluginId,
        mut command: Command,
        max_consecutive_timeouts: u32,
    ) -> std::io::Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(plugin.clone(), stderr));
        }
        debug!(plugin = %plugin, pid = ?child.id(), "worker process spawned");

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (outbound, queue) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);

        tokio::spawn(write_loop(plugin.clone(), stdin, queue));
        tokio::spawn(read_loop(plugin.clone(), stdout, Arc::clone(&pending)));
        tokio::spawn(monitor_exit(
            plugin.clone(),
            child,
            kill_rx,
            Arc::clone(&pending),
            Arc::clone(&alive),
            exited_tx,
        ));

        Ok(Self {
            plugin,
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            consecutive_timeouts: AtomicU32::new(0),
            max_consecutive_timeouts,
            kill: Mutex::new(Some(kill_tx)),
            exited,
        })
    }

    /// Whether the process is still running.
    ///
    /// `alive` only turns false while the exit monitor holds the pending
    /// lock, so a waiter registered under that lock with `alive` still true
    /// is guaranteed to be drained.
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Running and under the consecutive-timeout limit.
    pub(crate) fn is_healthy(&self) -> bool {
        self.is_alive()
            && self.consecutive_timeouts.load(Ordering::SeqCst) < self.max_consecutive_timeouts
    }

    /// Send one request and wait for its response.
    ///
    /// A timeout abandons the wait only: the worker keeps running and the
    /// late response is dropped by the reader.
    pub(crate) async fn call(&self, method: &str, params: Value, timeout: Duration) -> InvocationResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&Request {
            id,
            method: method.to_owned(),
            params,
        })
        .map_err(|e| StructuredError::internal(format!("failed to encode request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_map();
            if !self.is_alive() {
                return Err(StructuredError::host_terminated(self.plugin.as_str()));
            }
            pending.insert(id, tx);
        }

        if self.outbound.send(line).await.is_err() {
            self.pending_map().remove(&id);
            return Err(StructuredError::host_terminated(self.plugin.as_str()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => {
                self.consecutive_timeouts.store(0, Ordering::SeqCst);
                result
            },
            Ok(Err(_)) => Err(StructuredError::host_terminated(self.plugin.as_str())),
            Err(_) => {
                self.pending_map().remove(&id);
                let count = self
                    .consecutive_timeouts
                    .fetch_add(1, Ordering::SeqCst)
                    .saturating_add(1);
                warn!(
                    plugin = %self.plugin,
                    method,
                    id,
                    consecutive = count,
                    "worker call timed out"
                );
                Err(StructuredError::timeout(timeout))
            },
        }
    }

    /// Ask the worker to exit, then kill it if it has not gone within
    /// `grace`.
    pub(crate) async fn terminate(&self, grace: Duration) {
        if self.is_alive() {
            if let Err(e) = self.call(METHOD_SHUTDOWN, Value::Null, grace).await {
                debug!(plugin = %self.plugin, error = %e, "worker did not acknowledge shutdown");
            }
            let mut exited = self.exited.clone();
            if tokio::time::timeout(grace, exited.wait_for(|done| *done))
                .await
                .is_err()
            {
                warn!(plugin = %self.plugin, "worker ignored shutdown, killing");
            }
        }
        self.kill().await;
    }

    /// Kill the process and wait for the exit monitor to observe it.
    pub(crate) async fn kill(&self) {
        let signal = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(signal) = signal {
            let _ = signal.send(());
        }
        let mut exited = self.exited.clone();
        let _ = exited.wait_for(|done| *done).await;
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<InvocationResult>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(signal) = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = signal.send(());
        }
    }
}

async fn write_loop(plugin: PluginId, mut stdin: ChildStdin, mut queue: mpsc::Receiver<String>) {
    while let Some(line) = queue.recv().await {
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(plugin = %plugin, error = %e, "worker stdin closed");
            break;
        }
    }
}

async fn read_loop(plugin: PluginId, stdout: ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => route_response(&plugin, &pending, &line),
            Ok(None) => break,
            Err(e) => {
                warn!(plugin = %plugin, error = %e, "failed to read worker stdout");
                break;
            },
        }
    }
    debug!(plugin = %plugin, "worker stdout closed");
}

fn route_response(plugin: &PluginId, pending: &Pending, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let response: Response = match serde_json::from_str(line) {
        Ok(response) => response,
        Err(e) => {
            warn!(plugin = %plugin, error = %e, "ignoring malformed worker line");
            return;
        },
    };
    let Some(id) = response.id else {
        warn!(plugin = %plugin, "ignoring worker line without id");
        return;
    };
    let waiter = pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&id);
    match waiter {
        Some(waiter) => {
            let _ = waiter.send(response.into_result());
        },
        None => debug!(plugin = %plugin, id, "dropping late response"),
    }
}

async fn forward_stderr(plugin: PluginId, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(plugin = %plugin, "worker: {line}");
    }
}

async fn monitor_exit(
    plugin: PluginId,
    mut child: Child,
    kill: oneshot::Receiver<()>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    exited: watch::Sender<bool>,
) {
    let status: std::io::Result<ExitStatus> = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                debug!(plugin = %plugin, error = %e, "kill failed, process may have exited");
            }
            child.wait().await
        },
    };

    let orphaned: Vec<_> = {
        let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
        alive.store(false, Ordering::SeqCst);
        pending.drain().collect()
    };
    match &status {
        Ok(status) if status.success() => {
            info!(plugin = %plugin, in_flight = orphaned.len(), "worker exited");
        },
        Ok(status) => {
            warn!(plugin = %plugin, %status, in_flight = orphaned.len(), "worker terminated");
        },
        Err(e) => {
            warn!(plugin = %plugin, error = %e, "failed to wait for worker");
        },
    }
    for (_, waiter) in orphaned {
        let _ = waiter.send(Err(StructuredError::host_terminated(plugin.as_str())));
    }
    let _ = exited.send(true);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bridge::ErrorCode;
    use serde_json::json;

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    }

    fn plugin() -> PluginId {
        PluginId::new("sh-worker").unwrap()
    }

    #[tokio::test]
    async fn test_never_responding_call_times_out() {
        let worker = Worker::spawn(plugin(), sh("cat > /dev/null"), 2).unwrap();
        let err = worker
            .call("execute", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert!(worker.is_alive());
        assert!(worker.is_healthy());

        worker
            .call("execute", json!({}), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(worker.is_alive());
        assert!(!worker.is_healthy());
        worker.kill().await;
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn test_crash_fails_in_flight_call() {
        // Reads one request, then dies without answering.
        let worker = Worker::spawn(plugin(), sh("read line; exit 3"), 3).unwrap();
        let err = worker
            .call("execute", json!({}), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HostTerminated);

        let mut exited = worker.exited.clone();
        exited.wait_for(|done| *done).await.unwrap();
        let err = worker
            .call("execute", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HostTerminated);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_calls_racing_an_exit_never_hang() {
        // Dies after the first request; the rest race the exit monitor.
        let worker = Arc::new(Worker::spawn(plugin(), sh("read line; exit 3"), 3).unwrap());
        let mut calls = tokio::task::JoinSet::new();
        for _ in 0..32 {
            let worker = Arc::clone(&worker);
            calls.spawn(async move {
                worker
                    .call("execute", json!({}), Duration::from_secs(60))
                    .await
            });
        }

        let results = tokio::time::timeout(Duration::from_secs(10), calls.join_all())
            .await
            .expect("a call registered after exit was never failed");
        assert_eq!(results.len(), 32);
        for result in results {
            assert_eq!(result.unwrap_err().code, ErrorCode::HostTerminated);
        }
        assert!(!worker.is_alive());
    }

    #[tokio::test]
    async fn test_call_after_exit_fails_immediately() {
        let worker = Worker::spawn(plugin(), sh("exit 0"), 3).unwrap();
        let mut exited = worker.exited.clone();
        exited.wait_for(|done| *done).await.unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(1),
            worker.call("execute", json!({}), Duration::from_secs(60)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::HostTerminated);
        assert!(worker.pending_map().is_empty());
    }

    #[tokio::test]
    async fn test_responses_routed_by_id() {
        // Answers each request with its own id.
        let script = r#"while read line; do id=$(echo "$line" | sed 's/.*"id":\([0-9]*\).*/\1/'); echo "{\"id\":$id,\"result\":$id}"; done"#;
        let worker = Arc::new(Worker::spawn(plugin(), sh(script), 3).unwrap());

        let calls: Vec<_> = (0..8)
            .map(|_| {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    worker
                        .call("execute", json!({}), Duration::from_secs(10))
                        .await
                })
            })
            .collect();
        let mut ids = Vec::new();
        for call in calls {
            ids.push(call.await.unwrap().unwrap().as_u64().unwrap());
        }
        ids.sort_unstable();
        assert_eq!(ids, (1..=8).collect::<Vec<u64>>());
        worker.kill().await;
    }
}
