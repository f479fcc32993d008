//! Test double for the backend services reachable over the bus: identity
//! authority, toolset catalog and two tool hosters.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::{
    bus::{subjects, BusMessage, InMemoryBus, MessageBus},
    toolset::{Tool, ToolSnapshot, ToolsetIdentity},
};

pub struct MockBackend {
    bus: InMemoryBus,
    tools: Arc<Mutex<Vec<Tool>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockBackend {
    pub const TOOLSET_KEY: &'static str = "tk_valid";
    pub const MASTER_KEY: &'static str = "mk_valid";
    pub const INVALID_KEY_MESSAGE: &'static str = "invalid or revoked key";
    pub const TOOL_FAILURE_MESSAGE: &'static str = "disk quota exceeded";

    pub fn identity() -> ToolsetIdentity {
        ToolsetIdentity {
            workspace_id: "ws-1".to_string(),
            toolset_id: "ts-1".to_string(),
            toolset_name: "research".to_string(),
        }
    }

    pub fn echo_tool() -> Tool {
        Tool {
            id: "echo".to_string(),
            name: "echo".to_string(),
            description: Some("Echo the given text".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
            annotations: Some(json!({ "readOnlyHint": true })),
        }
    }

    pub fn failing_tool() -> Tool {
        Tool {
            id: "explode".to_string(),
            name: "explode".to_string(),
            description: None,
            input_schema: json!({ "type": "object" }),
            annotations: None,
        }
    }

    /// Listed in the catalog, hosted nowhere.
    pub fn orphan_tool() -> Tool {
        Tool {
            id: "orphan".to_string(),
            name: "orphan".to_string(),
            description: None,
            input_schema: json!({ "type": "object" }),
            annotations: None,
        }
    }

    pub async fn start(bus: &InMemoryBus) -> Self {
        let tools = Arc::new(Mutex::new(Vec::new()));
        let mut backend = Self {
            bus: bus.clone(),
            tools: Arc::clone(&tools),
            tasks: Vec::new(),
        };

        backend
            .respond(subjects::IDENTITY_HANDSHAKE, |request| {
                let key = request["key"].as_str().unwrap_or_default();
                match key {
                    Self::TOOLSET_KEY => json!({
                        "nature": "toolset",
                        "workspaceId": "ws-1",
                        "id": "ts-1",
                        "name": "research"
                    }),
                    Self::MASTER_KEY => {
                        let name = request["name"].as_str().unwrap_or_default();
                        json!({
                            "nature": "toolset",
                            "workspaceId": "ws-1",
                            "id": format!("ts-{name}"),
                            "name": name
                        })
                    }
                    _ => json!({ "error": Self::INVALID_KEY_MESSAGE }),
                }
            })
            .await;

        backend
            .respond("toolsets.*.tools.snapshot", move |_| {
                let tools = tools.lock().map(|tools| tools.clone()).unwrap_or_default();
                json!(ToolSnapshot { tools })
            })
            .await;

        backend
            .respond(&subjects::tool_call("echo"), |request| {
                let arguments = &request["arguments"];
                let text = arguments["text"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| arguments.to_string());
                json!({
                    "result": {
                        "content": [{ "type": "text", "text": text }],
                        "isError": false
                    }
                })
            })
            .await;

        backend
            .respond(&subjects::tool_call("explode"), |_| {
                json!({ "error": Self::TOOL_FAILURE_MESSAGE })
            })
            .await;

        backend
    }

    pub fn bus(&self) -> &InMemoryBus {
        &self.bus
    }

    pub fn set_tools(&self, tools: Vec<Tool>) {
        if let Ok(mut current) = self.tools.lock() {
            *current = tools;
        }
    }

    pub async fn announce_tools(&self, tools: Vec<Tool>) {
        self.set_tools(tools.clone());
        let payload = serde_json::to_vec(&ToolSnapshot { tools }).expect("encode snapshot");
        self.bus
            .publish(&subjects::toolset_tools(&Self::identity().toolset_id), payload)
            .await
            .expect("publish snapshot");
    }

    async fn respond<F>(&mut self, subject: &str, handler: F)
    where
        F: Fn(&Value) -> Value + Send + 'static,
    {
        let mut subscription = self.bus.subscribe(subject).await.expect("subscribe");
        let bus = self.bus.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(BusMessage { reply, payload, .. }) = subscription.next().await {
                let request: Value = serde_json::from_slice(&payload).unwrap_or(Value::Null);
                if let Some(reply) = reply {
                    let response = serde_json::to_vec(&handler(&request)).expect("encode reply");
                    let _ = bus.publish(&reply, response).await;
                }
            }
            let _ = subscription.unsubscribe().await;
        }));
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
