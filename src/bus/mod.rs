//! Message bus seam
//!
//! The runtime talks to the identity authority, the toolset catalog and the
//! tool hosters exclusively through request/reply and publish/subscribe on
//! a subject-addressed bus. `NatsBus` is the production implementation,
//! `InMemoryBus` keeps everything in-process.

use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

pub mod memory;
pub mod nats;
pub mod subjects;

pub use memory::InMemoryBus;
pub use nats::NatsBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no responders available on {subject}")]
    NoResponders { subject: String },
    #[error("request on {subject} timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u128 },
    #[error("bus connection error: {0}")]
    Connection(String),
    #[error("bus subscription closed")]
    Closed,
}

impl BusError {
    pub fn timeout(subject: &str, timeout: Duration) -> Self {
        Self::Timeout {
            subject: subject.to_string(),
            timeout_ms: timeout.as_millis(),
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Single request/response round-trip bounded by `timeout`.
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError>;
}

#[async_trait]
pub trait Subscription: Stream<Item = BusMessage> + Send + Unpin {
    async fn unsubscribe(&mut self) -> Result<(), BusError>;
}
