use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::mcp::rpc::json_rpc_error;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const SERVER_ERROR: i32 = -32000;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{message}")]
    Validation { message: &'static str },
    #[error("Authentication failed: {message}")]
    Authentication { message: String },
    #[error("{message}")]
    Protocol {
        status: StatusCode,
        code: i32,
        message: String,
    },
    #[error("{message}")]
    ToolCall { message: String },
    #[error("{message}")]
    Transport { status: StatusCode, message: String },
    #[error("internal error")]
    Internal { message: String },
}

impl AppError {
    pub fn validation(message: &'static str) -> Self {
        Self::Validation { message }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    pub fn protocol(status: StatusCode, code: i32, message: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn no_valid_session() -> Self {
        Self::protocol(
            StatusCode::BAD_REQUEST,
            SERVER_ERROR,
            "Bad Request: No valid session ID provided",
        )
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::protocol(
            StatusCode::NOT_FOUND,
            SERVER_ERROR,
            format!("Session not found: {session_id}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::protocol(StatusCode::BAD_REQUEST, INVALID_PARAMS, message)
    }

    pub fn tool_call(message: impl Into<String>) -> Self {
        Self::ToolCall {
            message: message.into(),
        }
    }

    pub fn transport(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Authentication { .. } => StatusCode::UNAUTHORIZED,
            Self::Protocol { status, .. } | Self::Transport { status, .. } => *status,
            Self::ToolCall { .. } => StatusCode::OK,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Self::Validation { .. } | Self::Authentication { .. } | Self::Transport { .. } => {
                SERVER_ERROR
            }
            Self::Protocol { code, .. } => *code,
            Self::ToolCall { .. } | Self::Internal { .. } => INTERNAL_ERROR,
        }
    }

    /// Message safe to hand to a client. Internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal { message } => {
                tracing::error!(error = %message, "request failed with internal error");
                "Internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.json_rpc_code();
        let message = self.client_message();

        (status, Json(json_rpc_error(None, code, &message))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_hides_detail_from_clients() {
        let error = AppError::internal("bus handle poisoned at 0xdeadbeef");
        assert_eq!(error.client_message(), "Internal error");
        assert_eq!(error.json_rpc_code(), INTERNAL_ERROR);
        assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn authentication_error_echoes_backend_cause() {
        let error = AppError::authentication("invalid toolset key");
        assert_eq!(
            error.client_message(),
            "Authentication failed: invalid toolset key"
        );
        assert_eq!(error.json_rpc_code(), SERVER_ERROR);
        assert_eq!(error.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn missing_session_is_a_server_error() {
        let error = AppError::no_valid_session();
        assert_eq!(error.json_rpc_code(), SERVER_ERROR);
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }
}
