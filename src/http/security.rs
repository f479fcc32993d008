//! Request screening shared by the HTTP transports: Origin allow-listing,
//! `mcp-protocol-version` and `Accept` checks, and a CORS decorator that
//! stamps headers onto every response leaving the router.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use axum_extra::{headers::Origin, TypedHeader};

use crate::{
    errors::{AppError, SERVER_ERROR},
    mcp::server::SUPPORTED_PROTOCOL_VERSIONS,
    AppState,
};

pub const SESSION_ID_HEADER: &str = "mcp-session-id";
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";
/// Assumed when a client omits `mcp-protocol-version`.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-03-26";

pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_EVENT_STREAM: &str = "text/event-stream";

const ALLOW_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const ALLOW_HEADERS: &str = "content-type, accept, authorization, last-event-id, \
     mcp-session-id, mcp-protocol-version, master_key, toolset_key, toolset_name";
const EXPOSE_HEADERS: &str = "mcp-session-id, mcp-protocol-version";
const PREFLIGHT_MAX_AGE: &str = "86400";

const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "[::1]", "::1"];

pub async fn validate_origin(
    State(state): State<AppState>,
    origin: Option<TypedHeader<Origin>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.settings.dns_rebinding_protection {
        return Ok(next.run(request).await);
    }

    let Some(TypedHeader(origin)) = origin else {
        return Err(AppError::transport(
            StatusCode::FORBIDDEN,
            "Forbidden: missing Origin header",
        ));
    };

    if !origin_allowed(&origin, &state.settings.allowed_origins) {
        return Err(AppError::transport(
            StatusCode::FORBIDDEN,
            format!("Forbidden: origin '{}' is not allowed", serialize_origin(&origin)),
        ));
    }

    Ok(next.run(request).await)
}

/// An empty allow-list admits loopback origins only.
pub fn origin_allowed(origin: &Origin, allowed_origins: &[String]) -> bool {
    if origin.is_null() {
        return false;
    }

    if allowed_origins.is_empty() {
        return LOCAL_HOSTS.contains(&origin.hostname());
    }

    let serialized = serialize_origin(origin);
    allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(&serialized))
}

fn serialize_origin(origin: &Origin) -> String {
    if origin.is_null() {
        return "null".to_string();
    }
    match origin.port() {
        Some(port) => format!("{}://{}:{port}", origin.scheme(), origin.hostname()),
        None => format!("{}://{}", origin.scheme(), origin.hostname()),
    }
}

/// Returns the version the request speaks. Absent means the backwards
/// compatible default.
pub fn validate_protocol_version(headers: &HeaderMap) -> Result<String, AppError> {
    let Some(value) = headers.get(PROTOCOL_VERSION_HEADER) else {
        return Ok(DEFAULT_PROTOCOL_VERSION.to_string());
    };

    let version = value.to_str().unwrap_or_default().trim();
    if SUPPORTED_PROTOCOL_VERSIONS.contains(&version) {
        return Ok(version.to_string());
    }

    Err(AppError::protocol(
        StatusCode::BAD_REQUEST,
        SERVER_ERROR,
        format!(
            "Bad Request: Unsupported protocol version (supported versions: {})",
            SUPPORTED_PROTOCOL_VERSIONS.join(", ")
        ),
    ))
}

pub fn validate_accept(headers: &HeaderMap, required: &[&str]) -> Result<(), AppError> {
    let accepted: Vec<String> = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|media| {
            media
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
        .collect();

    let satisfied = required.iter().all(|media_type| {
        accepted
            .iter()
            .any(|accepted| accepted == media_type || accepted == "*/*")
    });
    if satisfied {
        return Ok(());
    }

    Err(AppError::transport(
        StatusCode::NOT_ACCEPTABLE,
        format!("Not Acceptable: Client must accept {}", required.join(" and ")),
    ))
}

/// Decorates every response, including streaming ones and those produced by
/// inner middleware rejections. Answers preflight requests directly.
pub async fn cors_headers(request: Request, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors(response.headers_mut(), origin);
        response.headers_mut().insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static(PREFLIGHT_MAX_AGE),
        );
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors(response.headers_mut(), origin);
    response
}

fn apply_cors(headers: &mut HeaderMap, origin: Option<HeaderValue>) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        origin.unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSE_HEADERS),
    );
    headers.append(header::VARY, HeaderValue::from_static("Origin"));
}
