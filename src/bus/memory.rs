use std::{
    collections::HashMap,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{subjects::subject_matches, BusError, BusMessage, MessageBus, Subscription};

/// In-process bus with NATS semantics: wildcard subjects, reply inboxes and
/// "no responders" when a request finds no subscriber.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    next_sid: u64,
    subscribers: HashMap<u64, Subscriber>,
}

struct Subscriber {
    pattern: String,
    sender: mpsc::UnboundedSender<BusMessage>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions, reply inboxes included.
    pub fn subscription_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }

    fn register(&self, pattern: &str) -> MemorySubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut registry = lock(&self.inner);
        registry.next_sid += 1;
        let sid = registry.next_sid;
        registry.subscribers.insert(
            sid,
            Subscriber {
                pattern: pattern.to_string(),
                sender,
            },
        );

        MemorySubscription {
            sid,
            registry: Arc::clone(&self.inner),
            receiver,
        }
    }

    /// Returns how many subscribers received the message.
    fn deliver(&self, subject: &str, reply: Option<String>, payload: Vec<u8>) -> usize {
        let mut registry = lock(&self.inner);
        registry
            .subscribers
            .retain(|_, subscriber| !subscriber.sender.is_closed());

        registry
            .subscribers
            .values()
            .filter(|subscriber| subject_matches(&subscriber.pattern, subject))
            .filter(|subscriber| {
                subscriber
                    .sender
                    .send(BusMessage {
                        subject: subject.to_string(),
                        reply: reply.clone(),
                        payload: payload.clone(),
                    })
                    .is_ok()
            })
            .count()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut replies = self.register(&inbox);

        if self.deliver(subject, Some(inbox), payload) == 0 {
            return Err(BusError::NoResponders {
                subject: subject.to_string(),
            });
        }

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(message)) => Ok(message.payload),
            Ok(None) => Err(BusError::Closed),
            Err(_) => Err(BusError::timeout(subject, timeout)),
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.deliver(subject, None, payload);
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError> {
        Ok(Box::new(self.register(subject)))
    }
}

pub struct MemorySubscription {
    sid: u64,
    registry: Arc<Mutex<Registry>>,
    receiver: mpsc::UnboundedReceiver<BusMessage>,
}

impl MemorySubscription {
    fn detach(&mut self) {
        lock(&self.registry).subscribers.remove(&self.sid);
        self.receiver.close();
    }
}

impl Stream for MemorySubscription {
    type Item = BusMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        self.detach();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
