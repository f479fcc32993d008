//! Legacy SSE transport: `GET /sse` holds the event stream open and
//! `POST /messages?sessionId=...` carries client frames. Replies travel back
//! over the stream, so `POST` only acknowledges receipt.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

use crate::{
    auth::AuthHeaders,
    errors::{AppError, PARSE_ERROR},
    mcp::{rpc::json_rpc_error, server::handle_json_rpc_payload},
    session::{open_session, SessionRegistry, TransportHandle, TransportKind},
    AppState,
};

pub const MESSAGES_PATH: &str = "/messages";

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub async fn open_sse(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let session_id = Uuid::new_v4().to_string();
    let (transport, frames) = TransportHandle::queue(TransportKind::Sse);

    open_session(
        &state,
        &AuthHeaders::from_header_map(&headers),
        session_id.clone(),
        transport,
    )
    .await?;

    let endpoint = Event::default()
        .event("endpoint")
        .data(format!("{MESSAGES_PATH}?sessionId={session_id}"));
    let guard = CloseOnDrop {
        sessions: state.sessions.clone(),
        session_id,
    };

    let messages = UnboundedReceiverStream::new(frames)
        .map(|frame| Event::default().event("message").data(frame));
    let events = stream::once(async move { endpoint })
        .chain(messages)
        .map(move |event| {
            let _ = &guard;
            Ok::<_, Infallible>(event)
        });

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

pub async fn post_message(
    State(state): State<AppState>,
    Query(query): Query<MessagesQuery>,
    body: Bytes,
) -> Result<Response, AppError> {
    let session_id = query
        .session_id
        .filter(|session_id| !session_id.trim().is_empty())
        .ok_or_else(AppError::no_valid_session)?;
    let session = state
        .sessions
        .get(&session_id)
        .filter(|session| session.transport().kind() == TransportKind::Sse)
        .ok_or_else(|| AppError::session_not_found(&session_id))?;

    let reply = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => handle_json_rpc_payload(&state, &session_id, payload).await,
        Err(_) => Some(json_rpc_error(None, PARSE_ERROR, "Parse error")),
    };

    if let Some(reply) = reply {
        session.transport().send(&reply)?;
    }
    Ok((StatusCode::ACCEPTED, "Accepted").into_response())
}

/// Closes the session once the client drops the event stream.
struct CloseOnDrop {
    sessions: SessionRegistry,
    session_id: String,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        let sessions = self.sessions.clone();
        let session_id = std::mem::take(&mut self.session_id);
        debug!(session_id = %session_id, "sse stream dropped");

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                sessions.close(&session_id).await;
            });
        }
    }
}
