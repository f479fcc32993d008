//! Model Context Protocol (MCP) handling and JSON-RPC envelopes
//!
//! `server` resolves each frame's session and dispatches it; `rpc` builds the
//! response, error and notification frames.

pub mod rpc;
pub mod server;
