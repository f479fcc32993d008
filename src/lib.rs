use std::{future::Future, sync::Arc};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tracing::info;

pub mod auth;
pub mod bus;
pub mod config;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod session;
pub mod stdio;
pub mod toolset;

#[cfg(test)]
mod testing;

use bus::MessageBus;
use config::RuntimeSettings;
use session::SessionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<RuntimeSettings>,
    pub bus: Arc<dyn MessageBus>,
    pub sessions: SessionRegistry,
}

impl AppState {
    pub fn new(settings: RuntimeSettings, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            settings: Arc::new(settings),
            bus,
            sessions: SessionRegistry::new(),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route(
            "/mcp",
            post(http::streamable::post_mcp)
                .get(http::streamable::get_mcp)
                .delete(http::streamable::delete_mcp),
        )
        .route("/sse", get(http::sse::open_sse))
        .route(http::sse::MESSAGES_PATH, post(http::sse::post_message))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            http::security::validate_origin,
        ))
        .layer(middleware::from_fn(http::security::cors_headers))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}

/// Graceful-shutdown future for `axum::serve`: waits for `signal`, then
/// closes every live session. Open event streams only finish once their
/// transport closes, so this has to run before axum drains connections.
pub async fn close_sessions_on<F>(sessions: SessionRegistry, signal: F)
where
    F: Future<Output = ()>,
{
    signal.await;
    info!(sessions = sessions.len(), "closing remaining sessions");
    sessions.close_all().await;
}
