//! Streamable HTTP transport on `/mcp`
//!
//! `POST` carries client frames and gets JSON responses back, `GET` opens the
//! server-to-client notification stream and `DELETE` ends the session. The
//! session id travels in the `mcp-session-id` header.

use std::convert::Infallible;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use super::security::{
    validate_accept, validate_protocol_version, APPLICATION_JSON, SESSION_ID_HEADER,
    TEXT_EVENT_STREAM,
};
use crate::{
    auth::AuthHeaders,
    errors::{AppError, INVALID_REQUEST, PARSE_ERROR},
    mcp::{
        rpc::json_rpc_error,
        server::{handle_json_rpc_payload, validate_initialize_frame},
    },
    session::{open_session, SessionContext, TransportHandle},
    AppState,
};

pub async fn post_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    validate_accept(&headers, &[APPLICATION_JSON, TEXT_EVENT_STREAM])?;

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => {
            return Ok((
                StatusCode::BAD_REQUEST,
                Json(json_rpc_error(None, PARSE_ERROR, "Parse error")),
            )
                .into_response())
        }
    };

    let initialize_count = count_initialize_requests(&payload);

    let session_id = match session_id_header(&headers) {
        Some(session_id) => {
            if !state.sessions.contains(&session_id) {
                return Err(AppError::session_not_found(&session_id));
            }
            if initialize_count > 0 {
                return Err(AppError::protocol(
                    StatusCode::BAD_REQUEST,
                    INVALID_REQUEST,
                    "Invalid Request: Server already initialized",
                ));
            }
            validate_protocol_version(&headers)?;
            session_id
        }
        None if initialize_count == 0 => return Err(AppError::no_valid_session()),
        None => {
            if payload.is_array() && (initialize_count > 1 || batch_len(&payload) > 1) {
                return Err(AppError::protocol(
                    StatusCode::BAD_REQUEST,
                    INVALID_REQUEST,
                    "Invalid Request: Only one initialization request is allowed",
                ));
            }

            let frame = payload
                .as_array()
                .and_then(|frames| frames.first())
                .unwrap_or(&payload);
            if let Err(reply) = validate_initialize_frame(frame) {
                return Ok((StatusCode::BAD_REQUEST, Json(reply)).into_response());
            }

            let session_id = Uuid::new_v4().to_string();
            open_session(
                &state,
                &AuthHeaders::from_header_map(&headers),
                session_id.clone(),
                TransportHandle::streamable(),
            )
            .await?;
            session_id
        }
    };

    let response = match handle_json_rpc_payload(&state, &session_id, payload).await {
        Some(reply) => (StatusCode::OK, Json(reply)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    Ok(with_session_header(response, &session_id))
}

pub async fn get_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    validate_accept(&headers, &[TEXT_EVENT_STREAM])?;
    let session = require_session(&state, &headers)?;
    validate_protocol_version(&headers)?;

    let listener = session.transport().subscribe_stream().ok_or_else(|| {
        AppError::transport(StatusCode::GONE, "session transport is closed")
    })?;
    debug!(session_id = %session.id(), "notification stream opened");

    let response = Sse::new(notification_stream(BroadcastStream::new(listener)))
        .keep_alive(KeepAlive::default())
        .into_response();
    Ok(with_session_header(response, session.id()))
}

pub async fn delete_mcp(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let session = require_session(&state, &headers)?;
    validate_protocol_version(&headers)?;

    // A concurrent DELETE may win; either way the session is gone.
    state.sessions.close(session.id()).await;
    Ok(StatusCode::OK)
}

fn notification_stream(
    frames: BroadcastStream<String>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    frames.filter_map(|frame| async move {
        match frame {
            Ok(data) => Some(Ok(Event::default().event("message").data(data))),
            Err(err) => {
                warn!(error = %err, "notification stream lagged, frames skipped");
                None
            }
        }
    })
}

fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<std::sync::Arc<SessionContext>, AppError> {
    let session_id = session_id_header(headers).ok_or_else(AppError::no_valid_session)?;
    state
        .sessions
        .get(&session_id)
        .ok_or_else(|| AppError::session_not_found(&session_id))
}

fn session_id_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_ID_HEADER, value);
    }
    response
}

fn count_initialize_requests(payload: &Value) -> usize {
    let is_initialize = |frame: &Value| frame.get("method").and_then(Value::as_str) == Some("initialize");
    match payload {
        Value::Array(frames) => frames.iter().filter(|frame| is_initialize(frame)).count(),
        frame => usize::from(is_initialize(frame)),
    }
}

fn batch_len(payload: &Value) -> usize {
    payload.as_array().map_or(1, Vec::len)
}
