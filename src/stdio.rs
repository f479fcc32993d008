//! Newline-delimited JSON-RPC over the process's standard streams. One
//! implicit session lives until stdin reaches EOF.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::{
    auth::AuthHeaders,
    errors::{AppError, PARSE_ERROR},
    mcp::{rpc::json_rpc_error, server::handle_json_rpc_payload},
    session::{open_session, TransportHandle, TransportKind},
    AppState,
};

pub const STDIO_SESSION_ID: &str = "stdio";

pub async fn serve_stdio(state: AppState, credentials: AuthHeaders) -> Result<(), AppError> {
    serve(state, credentials, tokio::io::stdin(), tokio::io::stdout()).await
}

pub async fn serve<R, W>(
    state: AppState,
    credentials: AuthHeaders,
    reader: R,
    mut writer: W,
) -> Result<(), AppError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (transport, mut outbound) = TransportHandle::queue(TransportKind::Stdio);
    let session = open_session(&state, &credentials, STDIO_SESSION_ID.to_string(), transport).await?;

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let written = async {
                writer.write_all(frame.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            }
            .await;
            if let Err(err) = written {
                warn!(error = %err, "stdout closed, dropping outbound frames");
                break;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to read from stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<Value>(&line) {
            Ok(payload) => handle_json_rpc_payload(&state, session.id(), payload).await,
            Err(_) => Some(json_rpc_error(None, PARSE_ERROR, "Parse error")),
        };
        if let Some(reply) = reply {
            if let Err(err) = session.transport().send(&reply) {
                warn!(error = %err, "stdio transport closed while replying");
                break;
            }
        }
    }

    info!(session_id = %session.id(), "stdin closed");
    state.sessions.close(session.id()).await;
    if let Err(err) = writer_task.await {
        warn!(error = %err, "stdout writer task failed");
    }
    Ok(())
}
