use std::sync::Mutex;

use axum::http::StatusCode;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::errors::AppError;

const STREAM_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    StreamableHttp,
    Sse,
    Stdio,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::StreamableHttp => "stream",
            Self::Sse => "sse",
            Self::Stdio => "stdio",
        })
    }
}

enum Outbound {
    /// Streamable HTTP: zero or more `GET` streams may be listening.
    Broadcast(broadcast::Sender<String>),
    /// SSE and stdio: exactly one writer drains the queue.
    Queue(mpsc::UnboundedSender<String>),
}

/// Server-to-client half of a session's transport. Writes after `close`
/// fail with a transport error instead of reaching the wire.
pub struct TransportHandle {
    kind: TransportKind,
    outbound: Mutex<Option<Outbound>>,
}

impl TransportHandle {
    pub fn streamable() -> Self {
        let (sender, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            kind: TransportKind::StreamableHttp,
            outbound: Mutex::new(Some(Outbound::Broadcast(sender))),
        }
    }

    pub fn queue(kind: TransportKind) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            kind,
            outbound: Mutex::new(Some(Outbound::Queue(sender))),
        };
        (handle, receiver)
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// New listener for a Streamable HTTP `GET` stream.
    pub fn subscribe_stream(&self) -> Option<broadcast::Receiver<String>> {
        match self.lock().as_ref() {
            Some(Outbound::Broadcast(sender)) => Some(sender.subscribe()),
            _ => None,
        }
    }

    pub fn send(&self, message: &Value) -> Result<(), AppError> {
        let frame = serde_json::to_string(message)
            .map_err(|err| AppError::internal(format!("failed to encode frame: {err}")))?;

        match self.lock().as_ref() {
            Some(Outbound::Broadcast(sender)) => {
                if sender.send(frame).is_err() {
                    debug!(transport = %self.kind, "no stream listening, message dropped");
                }
                Ok(())
            }
            Some(Outbound::Queue(sender)) => sender
                .send(frame)
                .map_err(|_| AppError::transport(StatusCode::GONE, "session transport is closed")),
            None => Err(AppError::transport(
                StatusCode::GONE,
                "session transport is closed",
            )),
        }
    }

    /// Drops the sending half so every reader sees end-of-stream.
    pub fn close(&self) {
        self.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().is_none()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Outbound>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
