//! Per-session view of a toolset
//!
//! A `ToolsetService` is bound to one authenticated `ToolsetIdentity`. It keeps
//! the latest tool snapshot announced on the bus in a watch channel (the last
//! value doubles as the synchronous `tools/list` cache) and routes tool
//! invocations to whichever runtime hosts the tool.

use std::{
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::{
    bus::{subjects, BusError, MessageBus, Subscription},
    errors::AppError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsetIdentity {
    pub workspace_id: String,
    pub toolset_id: String,
    pub toolset_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

impl Tool {
    /// Shape served to MCP clients; the bus-level id stays internal.
    pub fn to_mcp(&self) -> Value {
        let mut tool = json!({
            "name": self.name,
            "inputSchema": self.input_schema,
        });
        if let Some(description) = &self.description {
            tool["description"] = Value::String(description.clone());
        }
        if let Some(annotations) = &self.annotations {
            tool["annotations"] = annotations.clone();
        }
        tool
    }
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Payload of snapshot announcements and snapshot replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSnapshot {
    pub tools: Vec<Tool>,
}

pub type SharedSnapshot = Arc<Vec<Tool>>;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallRequest<'a> {
    workspace_id: &'a str,
    toolset_id: &'a str,
    tool_id: &'a str,
    name: &'a str,
    arguments: &'a Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ToolCallResponse {
    Failure { error: String },
    Success { result: Value },
}

struct Listener {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct ToolsetService {
    identity: ToolsetIdentity,
    bus: Arc<dyn MessageBus>,
    snapshot: Arc<watch::Sender<Option<SharedSnapshot>>>,
    first: Arc<OnceLock<SharedSnapshot>>,
    listener: Mutex<Option<Listener>>,
    request_timeout: Duration,
    call_timeout: Duration,
}

impl ToolsetService {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        identity: ToolsetIdentity,
        request_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            identity,
            bus,
            snapshot: Arc::new(snapshot),
            first: Arc::new(OnceLock::new()),
            listener: Mutex::new(None),
            request_timeout,
            call_timeout,
        }
    }

    pub fn identity(&self) -> &ToolsetIdentity {
        &self.identity
    }

    /// Subscribes to snapshot announcements and fetches the current snapshot
    /// in the background. Only the subscribe round-trip is awaited.
    pub async fn start(&self) -> Result<(), AppError> {
        let subject = subjects::toolset_tools(&self.identity.toolset_id);
        let subscription = self.bus.subscribe(&subject).await.map_err(|err| {
            AppError::internal(format!("failed to subscribe to {subject}: {err}"))
        })?;

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(listen_for_snapshots(
            subscription,
            Arc::clone(&self.snapshot),
            Arc::clone(&self.first),
            shutdown_rx,
            self.identity.toolset_name.clone(),
        ));

        if let Some(previous) = self.lock_listener().replace(Listener { shutdown, task }) {
            warn!(toolset = %self.identity.toolset_name, "toolset service started twice");
            let _ = previous.shutdown.send(());
        }

        tokio::spawn(fetch_initial_snapshot(
            Arc::clone(&self.bus),
            Arc::clone(&self.snapshot),
            Arc::clone(&self.first),
            self.identity.clone(),
            self.request_timeout,
        ));

        debug!(toolset = %self.identity.toolset_name, subject = %subject, "toolset service started");
        Ok(())
    }

    /// Unsubscribes the snapshot listener. Later calls are no-ops.
    pub async fn stop(&self) {
        let Some(listener) = self.lock_listener().take() else {
            return;
        };

        let _ = listener.shutdown.send(());
        if let Err(err) = listener.task.await {
            warn!(toolset = %self.identity.toolset_name, error = %err, "snapshot listener panicked");
        }
        debug!(toolset = %self.identity.toolset_name, "toolset service stopped");
    }

    /// Every element is a full snapshot: the current one first (once known),
    /// then one per change.
    pub fn observe_tools(&self) -> impl Stream<Item = SharedSnapshot> + Send + 'static {
        WatchStream::new(self.snapshot.subscribe()).filter_map(|snapshot| async move { snapshot })
    }

    /// Snapshots that replace the first one this service ever held. Changes
    /// after the call are all seen, even if the first snapshot is still in
    /// flight and the two collapse into one watch update.
    pub fn observe_changes(&self) -> impl Stream<Item = SharedSnapshot> + Send + 'static {
        let first = Arc::clone(&self.first);
        WatchStream::from_changes(self.snapshot.subscribe()).filter_map(move |snapshot| {
            let first = Arc::clone(&first);
            async move {
                let snapshot = snapshot?;
                let is_first = first
                    .get()
                    .is_some_and(|known| Arc::ptr_eq(known, &snapshot));
                (!is_first).then_some(snapshot)
            }
        })
    }

    pub fn get_tools_for_mcp(&self) -> Vec<Value> {
        self.snapshot
            .borrow()
            .as_ref()
            .map(|tools| tools.iter().map(Tool::to_mcp).collect())
            .unwrap_or_default()
    }

    /// Resolves once a first snapshot (possibly empty) is known, or after
    /// `timeout`. Returns whether a snapshot arrived.
    pub async fn wait_for_tools(&self, timeout: Duration) -> bool {
        let mut receiver = self.snapshot.subscribe();
        let arrived = tokio::time::timeout(timeout, receiver.wait_for(Option::is_some))
            .await
            .map(|snapshot| snapshot.is_ok());
        match arrived {
            Ok(true) => true,
            Ok(false) | Err(_) => {
                warn!(
                    toolset = %self.identity.toolset_name,
                    timeout_ms = timeout.as_millis(),
                    "no tool snapshot received before timeout"
                );
                false
            }
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Result<Value, AppError> {
        let tool = self
            .snapshot
            .borrow()
            .as_ref()
            .and_then(|tools| tools.iter().find(|tool| tool.name == name).cloned())
            .ok_or_else(|| {
                AppError::tool_call(format!(
                    "unknown tool '{name}' in toolset '{}'",
                    self.identity.toolset_name
                ))
            })?;

        let payload = serde_json::to_vec(&ToolCallRequest {
            workspace_id: &self.identity.workspace_id,
            toolset_id: &self.identity.toolset_id,
            tool_id: &tool.id,
            name,
            arguments,
        })
        .map_err(|err| AppError::internal(format!("failed to encode tool call: {err}")))?;

        let response = self
            .bus
            .request(&subjects::tool_call(&tool.id), payload, self.call_timeout)
            .await
            .map_err(|err| match err {
                BusError::NoResponders { .. } => {
                    AppError::tool_call(format!("no runtime is hosting tool '{name}'"))
                }
                BusError::Timeout { timeout_ms, .. } => {
                    AppError::tool_call(format!("tool '{name}' timed out after {timeout_ms}ms"))
                }
                other => AppError::tool_call(format!("tool '{name}' could not be reached: {other}")),
            })?;

        match serde_json::from_slice::<ToolCallResponse>(&response) {
            Ok(ToolCallResponse::Success { result }) => {
                info!(toolset = %self.identity.toolset_name, tool = %name, "tool call completed");
                Ok(result)
            }
            Ok(ToolCallResponse::Failure { error }) => {
                Err(AppError::tool_call(format!("tool '{name}' failed: {error}")))
            }
            Err(_) => Err(AppError::tool_call(format!(
                "tool '{name}' returned an unexpected response"
            ))),
        }
    }

    fn lock_listener(&self) -> std::sync::MutexGuard<'_, Option<Listener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn listen_for_snapshots(
    mut subscription: Box<dyn Subscription>,
    snapshot: Arc<watch::Sender<Option<SharedSnapshot>>>,
    first: Arc<OnceLock<SharedSnapshot>>,
    mut shutdown: oneshot::Receiver<()>,
    toolset_name: String,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            message = subscription.next() => {
                let Some(message) = message else {
                    debug!(toolset = %toolset_name, "snapshot subscription ended");
                    break;
                };
                match serde_json::from_slice::<ToolSnapshot>(&message.payload) {
                    Ok(update) => {
                        debug!(toolset = %toolset_name, count = update.tools.len(), "tool snapshot announced");
                        let tools = Arc::new(update.tools);
                        snapshot.send_modify(|current| {
                            let _ = first.set(Arc::clone(&tools));
                            *current = Some(tools);
                        });
                    }
                    Err(err) => warn!(toolset = %toolset_name, error = %err, "ignoring malformed tool snapshot"),
                }
            }
        }
    }

    if let Err(err) = subscription.unsubscribe().await {
        warn!(toolset = %toolset_name, error = %err, "failed to unsubscribe snapshot listener");
    }
}

async fn fetch_initial_snapshot(
    bus: Arc<dyn MessageBus>,
    snapshot: Arc<watch::Sender<Option<SharedSnapshot>>>,
    first: Arc<OnceLock<SharedSnapshot>>,
    identity: ToolsetIdentity,
    timeout: Duration,
) {
    let subject = subjects::toolset_snapshot(&identity.toolset_id);
    let request = json!({ "workspaceId": identity.workspace_id, "toolsetId": identity.toolset_id });
    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to encode snapshot request");
            return;
        }
    };

    let fetched = match bus.request(&subject, payload, timeout).await {
        Ok(response) => serde_json::from_slice::<ToolSnapshot>(&response),
        Err(err) => {
            warn!(toolset = %identity.toolset_name, error = %err, "initial tool snapshot unavailable");
            return;
        }
    };

    match fetched {
        // An announcement that landed first is newer than this reply.
        Ok(update) => {
            let count = update.tools.len();
            let applied = snapshot.send_if_modified(|current| {
                if current.is_some() {
                    return false;
                }
                let tools = Arc::new(update.tools);
                let _ = first.set(Arc::clone(&tools));
                *current = Some(tools);
                true
            });
            debug!(toolset = %identity.toolset_name, count, applied, "initial tool snapshot fetched");
        }
        Err(err) => warn!(toolset = %identity.toolset_name, error = %err, "malformed initial tool snapshot"),
    }
}
