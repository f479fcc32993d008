use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tracing::info;

use super::{validate_auth_headers, AuthHeaders, IdentityHandshakeClient};
use crate::{bus::MessageBus, errors::AppError, toolset::ToolsetIdentity};

/// Validates a connection's credentials and runs the identity handshake.
/// The identity is kept once a handshake succeeds.
pub struct SessionAuthenticator {
    handshake: IdentityHandshakeClient,
    identity: Mutex<Option<ToolsetIdentity>>,
}

impl SessionAuthenticator {
    pub fn new(bus: Arc<dyn MessageBus>, handshake_timeout: Duration) -> Self {
        Self {
            handshake: IdentityHandshakeClient::new(bus, handshake_timeout),
            identity: Mutex::new(None),
        }
    }

    pub fn validate_auth_headers(&self, headers: &AuthHeaders) -> Result<(), AppError> {
        validate_auth_headers(headers)
    }

    pub async fn authenticate_via_handshake(
        &self,
        headers: &AuthHeaders,
    ) -> Result<ToolsetIdentity, AppError> {
        self.validate_auth_headers(headers)?;
        let key = headers
            .resolved_key()
            .ok_or_else(|| AppError::validation("one of master_key or toolset_key is required"))?;

        let identity = self
            .handshake
            .handshake(key, headers.toolset_name.as_deref())
            .await?;

        info!(
            workspace_id = %identity.workspace_id,
            toolset_id = %identity.toolset_id,
            toolset = %identity.toolset_name,
            "toolset authenticated"
        );

        *self
            .identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(identity.clone());
        Ok(identity)
    }

    pub fn identity(&self) -> Option<ToolsetIdentity> {
        self.identity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
