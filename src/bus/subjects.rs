//! Subject names shared with the backend services.

pub const IDENTITY_HANDSHAKE: &str = "identity.handshake";

/// Full tool snapshots announced whenever a toolset's catalog changes.
pub fn toolset_tools(toolset_id: &str) -> String {
    format!("toolsets.{toolset_id}.tools")
}

/// Request/reply subject returning the current snapshot of a toolset.
pub fn toolset_snapshot(toolset_id: &str) -> String {
    format!("toolsets.{toolset_id}.tools.snapshot")
}

/// Whoever hosts a tool listens here for invocations.
pub fn tool_call(tool_id: &str) -> String {
    format!("tools.{tool_id}.call")
}

/// NATS-style matching: `*` matches one token, a trailing `>` matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return pattern_tokens.next().is_none(),
            (Some("*"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
