//! Per-session MCP engine
//!
//! Decodes JSON-RPC frames, resolves the session they belong to and routes
//! `initialize`, `tools/list` and `tools/call` to the session's bound
//! toolset. Also owns the task that pushes `notifications/tools/list_changed`.

use std::sync::{Arc, Weak};

use futures::StreamExt;
use rust_mcp_sdk::schema::{
    CallToolRequest, Implementation, InitializeRequest, InitializeResult, JsonrpcMessage,
    JsonrpcRequest, ListToolsRequest, PingRequest, ServerCapabilities, ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::errors::{AppError, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND};
use crate::mcp::rpc::{
    app_error_to_json_rpc, is_json_rpc_error, json_rpc_error, json_rpc_notification,
    json_rpc_result, request_id_to_value, TOOLS_LIST_CHANGED,
};
use crate::session::SessionContext;
use crate::toolset::ToolsetService;
use crate::AppState;

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Single frame or batch. Returns `None` when nothing needs to be written
/// back (notifications only).
pub async fn handle_json_rpc_payload(
    state: &AppState,
    session_id: &str,
    payload: Value,
) -> Option<Value> {
    let Value::Array(batch) = payload else {
        return handle_json_rpc_value(state, session_id, payload).await;
    };

    if batch.is_empty() {
        return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request"));
    }

    let mut responses = Vec::new();
    for item in batch {
        if let Some(response) = handle_json_rpc_value(state, session_id, item).await {
            responses.push(response);
        }
    }

    (!responses.is_empty()).then_some(Value::Array(responses))
}

pub async fn handle_json_rpc_value(
    state: &AppState,
    session_id: &str,
    payload: Value,
) -> Option<Value> {
    if !payload.is_object() {
        return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request"));
    }

    let request_id = payload.get("id").cloned();
    let parsed: JsonrpcMessage = match serde_json::from_value(payload) {
        Ok(message) => message,
        Err(_) => return Some(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request")),
    };

    match parsed {
        JsonrpcMessage::Request(request) => {
            if let Err(error_response) = validate_request_shape(&request) {
                return Some(error_response);
            }

            let request_id = request_id_to_value(request.id);
            if request.method.trim().is_empty() {
                return Some(json_rpc_error(Some(request_id), INVALID_REQUEST, "Invalid Request"));
            }

            Some(
                handle_json_rpc_request(
                    state,
                    session_id,
                    Some(request_id),
                    request.method,
                    request.params.map(Value::Object),
                )
                .await,
            )
        }
        JsonrpcMessage::Notification(notification) => {
            if notification.method.trim().is_empty() {
                return None;
            }

            let _ = handle_json_rpc_request(
                state,
                session_id,
                None,
                notification.method,
                notification.params.map(Value::Object),
            )
            .await;
            None
        }
        // Replies to server-initiated requests; this server sends none.
        JsonrpcMessage::ResultResponse(_) | JsonrpcMessage::ErrorResponse(_) => None,
    }
}

pub fn validate_request_shape(request: &JsonrpcRequest) -> Result<(), Value> {
    let payload = serde_json::to_value(request).expect("jsonrpc request serialization");
    let request_id = Some(request_id_to_value(request.id.clone()));

    let valid = match request.method.as_str() {
        "tools/call" => serde_json::from_value::<CallToolRequest>(payload).is_ok(),
        "tools/list" => serde_json::from_value::<ListToolsRequest>(payload).is_ok(),
        "ping" => serde_json::from_value::<PingRequest>(payload).is_ok(),
        "initialize" => serde_json::from_value::<InitializeRequest>(payload).is_ok(),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(json_rpc_error(request_id, INVALID_PARAMS, "Invalid params"))
    }
}

/// Shape check for an `initialize` frame that has no session yet.
pub fn validate_initialize_frame(frame: &Value) -> Result<(), Value> {
    match serde_json::from_value::<JsonrpcMessage>(frame.clone()) {
        Ok(JsonrpcMessage::Request(request)) => validate_request_shape(&request),
        _ => Err(json_rpc_error(
            frame.get("id").cloned(),
            INVALID_REQUEST,
            "Invalid Request",
        )),
    }
}

pub async fn handle_json_rpc_request(
    state: &AppState,
    session_id: &str,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
) -> Value {
    let audit_params = redact_audit_params(params.as_ref());

    let outcome = match method.as_str() {
        "initialize" => initialize(state, session_id, params.as_ref()).await,
        "ping" | "notifications/initialized" => Ok(json!({})),
        "tools/list" => list_tools(state, session_id),
        "tools/call" => call_tool(state, session_id, params.as_ref()).await,
        _ => Err(AppError::protocol(
            axum::http::StatusCode::OK,
            METHOD_NOT_FOUND,
            "Method not found",
        )),
    };

    let response = match outcome {
        Ok(result) => json_rpc_result(id, result),
        Err(err) => app_error_to_json_rpc(id, &err),
    };

    info!(
        session_id = %session_id,
        method = %method,
        params = %audit_params,
        outcome = if is_json_rpc_error(&response) { "failure" } else { "success" },
        "mcp action audited"
    );

    response
}

fn bound_toolset(state: &AppState, session_id: &str) -> Result<Arc<ToolsetService>, AppError> {
    state
        .sessions
        .get(session_id)
        .and_then(|session| session.toolset().cloned())
        .ok_or_else(|| AppError::session_not_found(session_id))
}

async fn initialize(
    state: &AppState,
    session_id: &str,
    params: Option<&Value>,
) -> Result<Value, AppError> {
    let toolset = bound_toolset(state, session_id)?;
    toolset.wait_for_tools(state.settings.tools_wait_timeout).await;

    let initialize_result = InitializeResult {
        server_info: Implementation {
            name: toolset.identity().toolset_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(true),
            }),
            experimental: Some(Default::default()),
            ..Default::default()
        },
        protocol_version: negotiate_protocol_version(params).to_string(),
        instructions: None,
        meta: None,
    };

    serde_json::to_value(initialize_result)
        .map_err(|err| AppError::internal(format!("initialize result serialization: {err}")))
}

fn list_tools(state: &AppState, session_id: &str) -> Result<Value, AppError> {
    let toolset = bound_toolset(state, session_id)?;
    let tools = toolset.get_tools_for_mcp();
    info!(
        session_id = %session_id,
        toolset = %toolset.identity().toolset_name,
        count = tools.len(),
        "serving tools/list"
    );
    Ok(json!({ "tools": tools }))
}

async fn call_tool(
    state: &AppState,
    session_id: &str,
    params: Option<&Value>,
) -> Result<Value, AppError> {
    let toolset = bound_toolset(state, session_id)?;

    let name = params
        .and_then(|params| params.get("name"))
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| AppError::invalid_params("Invalid params: tools/call requires a tool name"))?;
    let arguments = params
        .and_then(|params| params.get("arguments"))
        .and_then(Value::as_object)
        .ok_or_else(|| {
            AppError::invalid_params("Invalid params: tools/call requires an arguments object")
        })?;

    toolset
        .call_tool(name, arguments)
        .await
        .map_err(|err| AppError::tool_call(format!("Error calling tools: {err}")))
}

/// Echoes the client's version when supported, otherwise counter-offers the
/// latest one.
pub fn negotiate_protocol_version(params: Option<&Value>) -> &'static str {
    let offered = params
        .and_then(|params| params.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim);

    offered
        .and_then(|offered| {
            SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .copied()
                .find(|supported| *supported == offered)
        })
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

/// Pushes `notifications/tools/list_changed` for every snapshot after the
/// first one known. Stops once the session or its transport is gone.
pub fn spawn_tool_notifier(context: &Arc<SessionContext>, toolset: &ToolsetService) -> JoinHandle<()> {
    let session: Weak<SessionContext> = Arc::downgrade(context);
    let session_id = context.id().to_string();
    let toolset_name = toolset.identity().toolset_name.clone();
    let mut changes = Box::pin(toolset.observe_changes());

    tokio::spawn(async move {
        while let Some(tools) = changes.next().await {
            let Some(context) = session.upgrade() else {
                break;
            };
            match context
                .transport()
                .send(&json_rpc_notification(TOOLS_LIST_CHANGED))
            {
                Ok(()) => debug!(
                    session_id = %session_id,
                    toolset = %toolset_name,
                    count = tools.len(),
                    "pushed tools/list_changed"
                ),
                Err(err) => {
                    debug!(session_id = %session_id, error = %err, "notification dropped after close");
                    break;
                }
            }
        }
    })
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "key" | "authorization" | "bearer" | "apikey" | "credentials" | "credential"
    ) || normalized.ends_with("_key")
        || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        auth::AuthHeaders,
        bus::InMemoryBus,
        config::RuntimeSettings,
        errors::{INTERNAL_ERROR, SERVER_ERROR},
        session::{open_session, TransportHandle, TransportKind},
        testing::MockBackend,
    };

    fn settings() -> RuntimeSettings {
        RuntimeSettings {
            tools_wait_timeout: Duration::from_millis(500),
            tool_call_timeout: Duration::from_millis(500),
            ..RuntimeSettings::default()
        }
    }

    async fn session(
        bus: &Arc<InMemoryBus>,
        transport: TransportHandle,
    ) -> (AppState, Arc<SessionContext>) {
        let state = AppState::new(settings(), bus.clone());
        let headers = AuthHeaders {
            toolset_key: Some(MockBackend::TOOLSET_KEY.to_string()),
            ..AuthHeaders::default()
        };
        let context = open_session(&state, &headers, "s-1".to_string(), transport)
            .await
            .expect("session");
        (state, context)
    }

    fn initialize_request(version: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": version,
                "capabilities": {},
                "clientInfo": { "name": "test-client", "version": "1.0.0" }
            }
        })
    }

    #[test]
    fn redacts_credentials_in_audit_params() {
        let params = json!({
            "name": "search",
            "arguments": {
                "query": "rust",
                "toolset_key": "should-not-appear",
                "api_key": "should-not-appear",
                "nested": { "access_token": "should-not-appear" }
            }
        });

        let redacted = redact_audit_params(Some(&params));

        assert_eq!(redacted["name"], json!("search"));
        assert_eq!(redacted["arguments"]["query"], json!("rust"));
        assert_eq!(redacted["arguments"]["toolset_key"], json!("[REDACTED]"));
        assert_eq!(redacted["arguments"]["api_key"], json!("[REDACTED]"));
        assert_eq!(
            redacted["arguments"]["nested"]["access_token"],
            json!("[REDACTED]")
        );
    }

    #[test]
    fn negotiation_echoes_supported_and_counter_offers_otherwise() {
        assert_eq!(
            negotiate_protocol_version(Some(&json!({ "protocolVersion": "2024-11-05" }))),
            "2024-11-05"
        );
        assert_eq!(
            negotiate_protocol_version(Some(&json!({ "protocolVersion": "2099-01-01" }))),
            LATEST_PROTOCOL_VERSION
        );
        assert_eq!(negotiate_protocol_version(None), LATEST_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn initialize_reports_the_toolset_and_list_changed() {
        let bus = Arc::new(InMemoryBus::new());
        let backend = MockBackend::start(&bus).await;
        backend.set_tools(vec![MockBackend::echo_tool()]);
        let (state, _context) = session(&bus, TransportHandle::streamable()).await;

        let response = handle_json_rpc_value(&state, "s-1", initialize_request("2025-03-26"))
            .await
            .expect("response");

        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["serverInfo"]["name"], "research");
        assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
        assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], true);
        assert_eq!(response["result"]["capabilities"]["experimental"], json!({}));

        // initialize waited for the first snapshot.
        let listed = handle_json_rpc_value(
            &state,
            "s-1",
            json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
        )
        .await
        .expect("response");
        assert_eq!(listed["result"]["tools"][0]["name"], "echo");
        state.sessions.close("s-1").await;
    }

    #[tokio::test]
    async fn unknown_session_is_reported_not_crashed() {
        let bus = Arc::new(InMemoryBus::new());
        let state = AppState::new(settings(), bus.clone());

        for request in [
            json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "echo", "arguments": { "text": "hi" } }
            }),
        ] {
            let response = handle_json_rpc_value(&state, "missing", request)
                .await
                .expect("response");
            assert_eq!(response["error"]["code"], SERVER_ERROR);
            assert_eq!(response["error"]["message"], "Session not found: missing");
        }
    }

    #[tokio::test]
    async fn call_tool_requires_an_arguments_object() {
        let bus = Arc::new(InMemoryBus::new());
        let backend = MockBackend::start(&bus).await;
        backend.set_tools(vec![MockBackend::echo_tool()]);
        let (state, _context) = session(&bus, TransportHandle::streamable()).await;

        let response = handle_json_rpc_value(
            &state,
            "s-1",
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": "echo" }
            }),
        )
        .await
        .expect("response");

        assert_eq!(response["error"]["code"], INVALID_PARAMS);
        assert!(state.sessions.contains("s-1"));
        state.sessions.close("s-1").await;
    }

    #[tokio::test]
    async fn tool_failures_name_the_operation_and_keep_the_session() {
        let bus = Arc::new(InMemoryBus::new());
        let backend = MockBackend::start(&bus).await;
        backend.set_tools(vec![MockBackend::echo_tool(), MockBackend::failing_tool()]);
        let (state, context) = session(&bus, TransportHandle::streamable()).await;
        context
            .toolset()
            .expect("bound")
            .wait_for_tools(Duration::from_secs(1))
            .await;

        let response = handle_json_rpc_value(
            &state,
            "s-1",
            json!({
                "jsonrpc": "2.0",
                "id": 4,
                "method": "tools/call",
                "params": { "name": "explode", "arguments": {} }
            }),
        )
        .await
        .expect("response");

        assert_eq!(response["error"]["code"], INTERNAL_ERROR);
        let message = response["error"]["message"].as_str().expect("message");
        assert!(message.starts_with("Error calling tools: "));
        assert!(message.contains(MockBackend::TOOL_FAILURE_MESSAGE));

        let echoed = handle_json_rpc_value(
            &state,
            "s-1",
            json!({
                "jsonrpc": "2.0",
                "id": 5,
                "method": "tools/call",
                "params": { "name": "echo", "arguments": { "text": "still here" } }
            }),
        )
        .await
        .expect("response");
        assert_eq!(echoed["result"]["content"][0]["text"], "still here");
        state.sessions.close("s-1").await;
    }

    #[tokio::test]
    async fn notifications_and_batches() {
        let bus = Arc::new(InMemoryBus::new());
        let _backend = MockBackend::start(&bus).await;
        let (state, _context) = session(&bus, TransportHandle::streamable()).await;

        let silent = handle_json_rpc_payload(
            &state,
            "s-1",
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        )
        .await;
        assert!(silent.is_none());

        let batch = handle_json_rpc_payload(
            &state,
            "s-1",
            json!([
                { "jsonrpc": "2.0", "id": 1, "method": "ping" },
                { "jsonrpc": "2.0", "method": "notifications/initialized" },
                { "jsonrpc": "2.0", "id": 2, "method": "resources/list" }
            ]),
        )
        .await
        .expect("responses");
        let batch = batch.as_array().expect("array");
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0]["result"], json!({}));
        assert_eq!(batch[1]["error"]["code"], METHOD_NOT_FOUND);

        let empty = handle_json_rpc_payload(&state, "s-1", json!([])).await.expect("error");
        assert_eq!(empty["error"]["code"], INVALID_REQUEST);
        state.sessions.close("s-1").await;
    }

    #[tokio::test]
    async fn snapshot_changes_are_pushed_to_the_session() {
        let bus = Arc::new(InMemoryBus::new());
        let backend = MockBackend::start(&bus).await;
        let (transport, mut frames) = TransportHandle::queue(TransportKind::Sse);
        let (state, context) = session(&bus, transport).await;
        context
            .toolset()
            .expect("bound")
            .wait_for_tools(Duration::from_secs(1))
            .await;
        backend.announce_tools(vec![MockBackend::echo_tool()]).await;

        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .expect("pushed in time")
            .expect("frame");
        let notification: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(notification["method"], TOOLS_LIST_CHANGED);

        state.sessions.close("s-1").await;
        assert!(frames.recv().await.is_none());
    }
}
