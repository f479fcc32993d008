//! Connection credentials and the identity handshake
//!
//! A connecting client presents either a master key plus a toolset name, or a
//! toolset key on its own. `SessionAuthenticator` checks that combination and
//! trades it for a `ToolsetIdentity` through the bus.

use axum::http::HeaderMap;

use crate::errors::AppError;

pub mod authenticator;
pub mod handshake;

pub use authenticator::SessionAuthenticator;
pub use handshake::IdentityHandshakeClient;

pub const MASTER_KEY_HEADER: &str = "master_key";
pub const TOOLSET_KEY_HEADER: &str = "toolset_key";
pub const TOOLSET_NAME_HEADER: &str = "toolset_name";

/// Raw credential material. Never persisted or logged.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthHeaders {
    pub master_key: Option<String>,
    pub toolset_key: Option<String>,
    pub toolset_name: Option<String>,
}

impl std::fmt::Debug for AuthHeaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthHeaders")
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("toolset_key", &self.toolset_key.as_ref().map(|_| "[REDACTED]"))
            .field("toolset_name", &self.toolset_name)
            .finish()
    }
}

impl AuthHeaders {
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        Self {
            master_key: header_value(headers, MASTER_KEY_HEADER),
            toolset_key: header_value(headers, TOOLSET_KEY_HEADER),
            toolset_name: header_value(headers, TOOLSET_NAME_HEADER),
        }
    }

    /// The key sent to the identity authority. Master key wins, although
    /// validation already forbids presenting both.
    pub fn resolved_key(&self) -> Option<&str> {
        self.master_key
            .as_deref()
            .or(self.toolset_key.as_deref())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Rules are checked in order; the first violation is reported.
pub fn validate_auth_headers(headers: &AuthHeaders) -> Result<(), AppError> {
    let has_master_key = headers.master_key.is_some();
    let has_toolset_key = headers.toolset_key.is_some();
    let has_toolset_name = headers.toolset_name.is_some();

    if has_master_key && has_toolset_key {
        return Err(AppError::validation(
            "master_key and toolset_key are mutually exclusive",
        ));
    }

    if !has_master_key && !has_toolset_key {
        return Err(AppError::validation(
            "one of master_key or toolset_key is required",
        ));
    }

    if has_master_key && !has_toolset_name {
        return Err(AppError::validation("master_key requires a toolset_name"));
    }

    if has_toolset_key && has_toolset_name {
        return Err(AppError::validation(
            "toolset_key must not be combined with a toolset_name",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(master: bool, toolset: bool, name: bool) -> AuthHeaders {
        AuthHeaders {
            master_key: master.then(|| "mk_1".to_string()),
            toolset_key: toolset.then(|| "tk_1".to_string()),
            toolset_name: name.then(|| "research".to_string()),
        }
    }

    #[test]
    fn accepts_exactly_two_combinations() {
        for master in [false, true] {
            for toolset in [false, true] {
                for name in [false, true] {
                    let accepted = validate_auth_headers(&headers(master, toolset, name)).is_ok();
                    let expected = matches!(
                        (master, toolset, name),
                        (true, false, true) | (false, true, false)
                    );
                    assert_eq!(accepted, expected, "master={master} toolset={toolset} name={name}");
                }
            }
        }
    }

    #[test]
    fn both_keys_are_mutually_exclusive() {
        let err = validate_auth_headers(&headers(true, true, true)).expect_err("both keys");
        assert_eq!(
            err.to_string(),
            "master_key and toolset_key are mutually exclusive"
        );
    }

    #[test]
    fn a_key_is_required() {
        let err = validate_auth_headers(&headers(false, false, true)).expect_err("no key");
        assert_eq!(err.to_string(), "one of master_key or toolset_key is required");
    }

    #[test]
    fn master_key_needs_a_name() {
        let err = validate_auth_headers(&headers(true, false, false)).expect_err("no name");
        assert_eq!(err.to_string(), "master_key requires a toolset_name");
    }

    #[test]
    fn toolset_key_rejects_a_name() {
        let err = validate_auth_headers(&headers(false, true, true)).expect_err("name given");
        assert_eq!(
            err.to_string(),
            "toolset_key must not be combined with a toolset_name"
        );
    }

    #[test]
    fn blank_headers_count_as_absent() {
        let mut map = HeaderMap::new();
        map.insert(TOOLSET_KEY_HEADER, HeaderValue::from_static("tk_abc"));
        map.insert(TOOLSET_NAME_HEADER, HeaderValue::from_static("   "));

        let parsed = AuthHeaders::from_header_map(&map);
        assert_eq!(parsed.toolset_key.as_deref(), Some("tk_abc"));
        assert!(parsed.toolset_name.is_none());
        assert!(validate_auth_headers(&parsed).is_ok());
    }

    #[test]
    fn debug_output_redacts_keys() {
        let rendered = format!("{:?}", headers(true, false, true));
        assert!(!rendered.contains("mk_1"));
        assert!(rendered.contains("research"));
    }
}
