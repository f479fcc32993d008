use std::sync::Arc;

use toolset_mcp_runtime::{
    auth::handshake::host_metadata,
    build_app,
    bus::NatsBus,
    close_sessions_on,
    config::{Config, TransportMode},
    logging, stdio, AppState,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let host = host_metadata();
    info!(host_ip = %host.host_ip, hostname = %host.hostname, "runtime host resolved");
    let bus = Arc::new(NatsBus::connect(&config.nats_servers).await?);
    let state = AppState::new(config.settings.clone(), bus);

    match config.transport {
        TransportMode::Stdio => {
            info!(nats_servers = %config.nats_servers, "serving MCP over stdio");
            stdio::serve_stdio(state, config.stdio_auth_headers()).await?;
        }
        TransportMode::Http => {
            let bind_socket = config.bind_socket()?;
            let app = build_app(state.clone());
            let listener = tokio::net::TcpListener::bind(bind_socket).await?;

            info!(
                bind_addr = %config.bind_addr,
                bind_port = config.bind_port,
                nats_servers = %config.nats_servers,
                "server starting"
            );

            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(close_sessions_on(
                    state.sessions.clone(),
                    shutdown_signal(),
                ))
                .await?;
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
