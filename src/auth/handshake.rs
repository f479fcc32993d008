//! Identity handshake over the bus
//!
//! One request/reply on `identity.handshake`: the runtime sends the resolved
//! key together with process metadata, the identity authority answers with
//! the toolset the key grants access to or with an error string.

use std::{
    net::{IpAddr, Ipv4Addr, UdpSocket},
    sync::{Arc, OnceLock},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    bus::{subjects, BusError, MessageBus},
    errors::AppError,
    toolset::ToolsetIdentity,
};

pub const TOOLSET_NATURE: &str = "toolset";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    pub key: String,
    pub nature: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub pid: u32,
    pub host_ip: String,
    pub hostname: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HandshakeResponse {
    Failure { error: String },
    Identity(IdentityPayload),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityPayload {
    nature: String,
    workspace_id: Option<String>,
    id: String,
    name: String,
}

/// Where this runtime process lives, as reported in every handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostMetadata {
    pub host_ip: String,
    pub hostname: String,
}

/// Resolved on first use and reused by every later handshake, so the socket
/// and hostname syscalls run once per process.
pub fn host_metadata() -> &'static HostMetadata {
    static HOST: OnceLock<HostMetadata> = OnceLock::new();
    HOST.get_or_init(|| HostMetadata {
        host_ip: host_ip().to_string(),
        hostname: host_name(),
    })
}

pub struct IdentityHandshakeClient {
    bus: Arc<dyn MessageBus>,
    timeout: Duration,
    host: &'static HostMetadata,
}

impl IdentityHandshakeClient {
    pub fn new(bus: Arc<dyn MessageBus>, timeout: Duration) -> Self {
        Self {
            bus,
            timeout,
            host: host_metadata(),
        }
    }

    pub async fn handshake(
        &self,
        key: &str,
        toolset_name: Option<&str>,
    ) -> Result<ToolsetIdentity, AppError> {
        let request = HandshakeRequest {
            key: key.to_string(),
            nature: TOOLSET_NATURE,
            name: toolset_name.map(str::to_string),
            pid: std::process::id(),
            host_ip: self.host.host_ip.clone(),
            hostname: self.host.hostname.clone(),
        };
        let payload = serde_json::to_vec(&request)
            .map_err(|err| AppError::internal(format!("failed to encode handshake: {err}")))?;

        debug!(toolset = ?toolset_name, pid = request.pid, "sending identity handshake");
        let response = self
            .bus
            .request(subjects::IDENTITY_HANDSHAKE, payload, self.timeout)
            .await
            .map_err(|err| match err {
                BusError::Timeout { timeout_ms, .. } => {
                    AppError::authentication(format!("handshake timed out after {timeout_ms}ms"))
                }
                BusError::NoResponders { .. } => {
                    AppError::authentication("identity service is unavailable")
                }
                other => AppError::authentication(format!("handshake failed: {other}")),
            })?;

        parse_handshake_response(&response)
    }
}

fn parse_handshake_response(payload: &[u8]) -> Result<ToolsetIdentity, AppError> {
    let response: HandshakeResponse = serde_json::from_slice(payload)
        .map_err(|_| AppError::authentication("unexpected handshake response"))?;

    let identity = match response {
        HandshakeResponse::Failure { error } => return Err(AppError::authentication(error)),
        HandshakeResponse::Identity(identity) => identity,
    };

    if identity.nature != TOOLSET_NATURE {
        return Err(AppError::authentication(format!(
            "expected a toolset identity, got '{}'",
            identity.nature
        )));
    }

    let Some(workspace_id) = identity.workspace_id else {
        return Err(AppError::authentication(
            "toolset identity has no workspace id",
        ));
    };

    Ok(ToolsetIdentity {
        workspace_id,
        toolset_id: identity.id,
        toolset_name: identity.name,
    })
}

/// Address of the interface that routes outbound traffic. Connecting a UDP
/// socket sends nothing on the wire.
fn host_ip() -> IpAddr {
    UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn host_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
