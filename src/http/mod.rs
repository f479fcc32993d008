//! HTTP transports for the Model Context Protocol
//!
//! Streamable HTTP on `/mcp`, the SSE pair `/sse` + `/messages`, metadata
//! endpoints and the request screening middleware they share.

pub mod handlers;
pub mod security;
pub mod sse;
pub mod streamable;
