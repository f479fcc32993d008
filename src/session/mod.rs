//! Session lifecycle
//!
//! A session is allocated as a partial `SessionContext`, registered under its
//! id as soon as the id exists, and completed in place once its
//! `ToolsetService` is running. Every code path that captured the `Arc`
//! earlier observes the completion.

use std::sync::{Arc, Mutex, OnceLock};

use axum::http::StatusCode;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod registry;
pub mod transport;

pub use registry::SessionRegistry;
pub use transport::{TransportHandle, TransportKind};

use crate::{
    auth::{AuthHeaders, SessionAuthenticator},
    errors::{AppError, SERVER_ERROR},
    mcp::server::spawn_tool_notifier,
    toolset::ToolsetService,
    AppState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered under its id, toolset not bound yet.
    Initialized,
    Active,
    Closing,
    Closed,
}

pub struct SessionContext {
    id: String,
    transport: TransportHandle,
    state: Mutex<SessionState>,
    toolset: OnceLock<Arc<ToolsetService>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("transport", &self.transport.kind())
            .field("state", &self.state())
            .field("bound", &self.toolset.get().is_some())
            .finish()
    }
}

impl SessionContext {
    pub fn new(id: String, transport: TransportHandle) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            state: Mutex::new(SessionState::Initialized),
            toolset: OnceLock::new(),
            notifier: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        *self.lock_state()
    }

    /// `None` until the session is completed.
    pub fn toolset(&self) -> Option<&Arc<ToolsetService>> {
        self.toolset.get()
    }

    /// `Initialized -> Active`. Fails if the session started closing first;
    /// the caller then still owns the toolset and must stop it.
    pub fn complete(
        &self,
        toolset: Arc<ToolsetService>,
        notifier: JoinHandle<()>,
    ) -> Result<(), AppError> {
        let mut state = self.lock_state();
        if *state != SessionState::Initialized || self.toolset.set(toolset).is_err() {
            notifier.abort();
            return Err(AppError::protocol(
                StatusCode::GONE,
                SERVER_ERROR,
                format!("Session closed during setup: {}", self.id),
            ));
        }

        *self
            .notifier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(notifier);
        *state = SessionState::Active;
        Ok(())
    }

    /// Returns `true` for the one caller that moves the session to `Closing`.
    pub fn begin_closing(&self) -> bool {
        let mut state = self.lock_state();
        match *state {
            SessionState::Initialized | SessionState::Active => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Closed => false,
        }
    }

    /// Stops the notifier, closes the transport and releases the toolset's
    /// bus subscriptions.
    pub async fn drain(&self) {
        let notifier = self
            .notifier
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(notifier) = notifier {
            notifier.abort();
        }

        self.transport.close();

        if let Some(toolset) = self.toolset.get() {
            toolset.stop().await;
        }
    }

    pub fn mark_closed(&self) {
        *self.lock_state() = SessionState::Closed;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Authenticates, registers the partial context under `session_id`, then
/// binds a running `ToolsetService` to it. Nothing is registered when
/// authentication fails.
pub async fn open_session(
    state: &AppState,
    headers: &AuthHeaders,
    session_id: String,
    transport: TransportHandle,
) -> Result<Arc<SessionContext>, AppError> {
    let authenticator =
        SessionAuthenticator::new(Arc::clone(&state.bus), state.settings.handshake_timeout);
    let identity = authenticator.authenticate_via_handshake(headers).await?;

    let context = SessionContext::new(session_id, transport);
    state.sessions.insert(Arc::clone(&context))?;

    let toolset = Arc::new(ToolsetService::new(
        Arc::clone(&state.bus),
        identity,
        state.settings.tools_wait_timeout,
        state.settings.tool_call_timeout,
    ));
    if let Err(err) = toolset.start().await {
        state.sessions.close(context.id()).await;
        return Err(err);
    }

    let notifier = spawn_tool_notifier(&context, &toolset);
    if let Err(err) = context.complete(Arc::clone(&toolset), notifier) {
        warn!(session_id = %context.id(), "session closed before it became active");
        toolset.stop().await;
        return Err(err);
    }

    info!(
        session_id = %context.id(),
        transport = %context.transport().kind(),
        toolset = %toolset.identity().toolset_name,
        "session opened"
    );
    Ok(context)
}
