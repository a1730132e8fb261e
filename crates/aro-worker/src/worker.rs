//! Handler registry and the request loop.

use std::collections::HashMap;
use std::sync::Arc;

use aro_telemetry::{CallContext, CallGuard};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ActionError, ActionResult, WorkerError, WorkerResult};
use crate::protocol::{
    ExecuteParams, METHOD_EXECUTE, METHOD_INFO, METHOD_QUALIFIER, METHOD_SHUTDOWN,
    QualifierParams, Request, Response,
};

type ActionHandler = Arc<dyn Fn(Value) -> ActionResult + Send + Sync>;
type QualifierHandler = Arc<dyn Fn(Value, &str) -> ActionResult + Send + Sync>;

/// Responses waiting for the writer.
const RESPONSE_BUFFER: usize = 64;

/// Lowercase, with `-`, `_` and spaces removed.
///
/// Must stay in sync with `aro_plugins::normalize_name`: the runtime sends
/// names it normalized that way and expects this table to match them.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Action entry of the metadata answer.
#[derive(Debug, Clone, Serialize)]
pub struct ActionInfo {
    /// Name the runtime passes back on `execute`.
    pub name: String,
    /// `inbound`, `internal`, `outbound` or `export`.
    pub role: String,
    /// Trigger verbs. Empty for service-only actions.
    pub verbs: Vec<String>,
    /// Allowed prepositions. Empty means any.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub prepositions: Vec<String>,
}

impl ActionInfo {
    /// Internal action triggered by its normalized name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            verbs: vec![normalize(&name)],
            name,
            role: "internal".into(),
            prepositions: Vec::new(),
        }
    }

    /// Set the role.
    #[must_use]
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Add a trigger verb.
    #[must_use]
    pub fn verb(mut self, verb: impl Into<String>) -> Self {
        let verb = normalize(&verb.into());
        if !self.verbs.contains(&verb) {
            self.verbs.push(verb);
        }
        self
    }

    /// Restrict the verbs to `preposition` (and any others added).
    #[must_use]
    pub fn preposition(mut self, preposition: impl Into<String>) -> Self {
        self.prepositions.push(preposition.into().to_lowercase());
        self
    }

    /// Reachable only as `service:method`.
    #[must_use]
    pub fn service_only(mut self) -> Self {
        self.verbs.clear();
        self
    }
}

/// Qualifier entry of the metadata answer.
#[derive(Debug, Clone, Serialize)]
pub struct QualifierInfo {
    /// Qualifier name.
    pub name: String,
    /// Accepted type names. Empty means any.
    #[serde(rename = "inputTypes")]
    pub input_types: Vec<String>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QualifierInfo {
    /// Qualifier accepting any type.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_types: Vec::new(),
            description: None,
        }
    }

    /// Accept `type_name`.
    #[must_use]
    pub fn input_type(mut self, type_name: impl Into<String>) -> Self {
        self.input_types.push(type_name.into());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A plugin worker: metadata plus the handlers behind it.
pub struct Worker {
    name: String,
    version: String,
    actions: Vec<ActionInfo>,
    qualifiers: Vec<QualifierInfo>,
    events: Vec<String>,
    action_handlers: HashMap<String, ActionHandler>,
    qualifier_handlers: HashMap<String, QualifierHandler>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("actions", &self.actions)
            .field("qualifiers", &self.qualifiers)
            .finish_non_exhaustive()
    }
}

impl Worker {
    /// Worker with no handlers.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            actions: Vec::new(),
            qualifiers: Vec::new(),
            events: Vec::new(),
            action_handlers: HashMap::new(),
            qualifier_handlers: HashMap::new(),
        }
    }

    /// Register an action. A later registration under the same name
    /// replaces the earlier one.
    #[must_use]
    pub fn action<F>(mut self, info: ActionInfo, handler: F) -> Self
    where
        F: Fn(Value) -> ActionResult + Send + Sync + 'static,
    {
        self.actions.retain(|a| a.name != info.name);
        self.action_handlers
            .insert(info.name.clone(), Arc::new(handler));
        self.actions.push(info);
        self
    }

    /// Register a qualifier. Names match case-insensitively.
    #[must_use]
    pub fn qualifier<F>(mut self, info: QualifierInfo, handler: F) -> Self
    where
        F: Fn(Value, &str) -> ActionResult + Send + Sync + 'static,
    {
        let key = info.name.to_lowercase();
        self.qualifiers.retain(|q| q.name.to_lowercase() != key);
        self.qualifier_handlers.insert(key, Arc::new(handler));
        self.qualifiers.push(info);
        self
    }

    /// Subscribe an action to `event`. The runtime invokes the action named
    /// after the event when it is emitted.
    #[must_use]
    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.events.push(event.into());
        self
    }

    /// Metadata answer for the `info` handshake.
    #[must_use]
    pub fn info(&self) -> Value {
        json!({
            "name": self.name,
            "version": self.version,
            "actions": self.actions,
            "qualifiers": self.qualifiers,
            "events": self.events,
        })
    }

    /// Answer one request synchronously.
    ///
    /// # Errors
    ///
    /// Returns `action-not-found` for an unknown action or qualifier,
    /// `invalid-arguments` for malformed parameters and `not-implemented`
    /// for methods this worker does not serve. Handler errors pass through.
    pub fn dispatch(&self, method: &str, params: Value) -> ActionResult {
        match method {
            METHOD_INFO => Ok(self.info()),
            METHOD_EXECUTE => {
                let params: ExecuteParams = serde_json::from_value(params)?;
                let handler = self
                    .action_handlers
                    .get(&params.action)
                    .ok_or_else(|| ActionError::not_found("action", &params.action))?;
                let _guard = CallGuard::new(
                    CallContext::new(METHOD_EXECUTE)
                        .with_plugin(self.name.clone())
                        .with_target(params.action.clone()),
                );
                handler(params.input)
            },
            METHOD_QUALIFIER => {
                let params: QualifierParams = serde_json::from_value(params)?;
                let handler = self
                    .qualifier_handlers
                    .get(&params.qualifier.to_lowercase())
                    .ok_or_else(|| ActionError::not_found("qualifier", &params.qualifier))?;
                let _guard = CallGuard::new(
                    CallContext::new(METHOD_QUALIFIER)
                        .with_plugin(self.name.clone())
                        .with_target(params.qualifier.clone()),
                );
                handler(params.value, &params.type_name).map(|value| json!({ "result": value }))
            },
            METHOD_SHUTDOWN => Ok(Value::Null),
            other => Err(ActionError::not_implemented(other)),
        }
    }

    /// Serve requests from stdin and answer on stdout until `shutdown` or
    /// end of input.
    ///
    /// # Errors
    ///
    /// Returns an error if stdin or stdout fail.
    pub async fn run(self) -> WorkerResult<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve requests from `reader`, answering on `writer`.
    ///
    /// Each request runs on the blocking pool, so a slow handler does not
    /// hold up the others and responses may arrive out of order. On
    /// `shutdown` the in-flight requests finish before the acknowledgement
    /// is written.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or writing fails.
    pub async fn serve<R, W>(self, reader: R, writer: W) -> WorkerResult<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let worker = Arc::new(self);
        let (tx, rx) = mpsc::channel::<Response>(RESPONSE_BUFFER);
        let writer_task = tokio::spawn(write_responses(rx, writer));

        info!(worker = %worker.name, version = %worker.version, "worker started");
        let mut in_flight = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();
        let mut shutdown_id = None;

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let request: Request = match serde_json::from_str(line) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "ignoring malformed request line");
                    continue;
                },
            };
            if request.method == METHOD_SHUTDOWN {
                shutdown_id = Some(request.id);
                break;
            }

            debug!(id = request.id, method = %request.method, "request received");
            let worker = Arc::clone(&worker);
            let tx = tx.clone();
            in_flight.spawn(async move {
                let Request { id, method, params } = request;
                let result =
                    tokio::task::spawn_blocking(move || worker.dispatch(&method, params)).await;
                let result = result.unwrap_or_else(|e| {
                    Err(ActionError::internal(format!("handler panicked: {e}")))
                });
                // The writer only stops on an I/O error, which `serve` reports.
                let _ = tx.send(Response::from_result(id, result)).await;
            });
        }

        while in_flight.join_next().await.is_some() {}
        if let Some(id) = shutdown_id {
            info!("shutdown requested");
            let _ = tx.send(Response::from_result(id, Ok(Value::Null))).await;
        }
        drop(tx);

        writer_task
            .await
            .map_err(|e| WorkerError::Writer(e.to_string()))??;
        info!(worker = %worker.name, "worker stopped");
        Ok(())
    }
}

async fn write_responses<W>(mut rx: mpsc::Receiver<Response>, mut writer: W) -> WorkerResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
