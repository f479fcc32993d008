use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_nats::client::RequestErrorKind;
use async_trait::async_trait;
use futures::Stream;
use tracing::info;

use super::{BusError, BusMessage, MessageBus, Subscription};

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(servers: &str) -> Result<Self, BusError> {
        let client = async_nats::connect(servers)
            .await
            .map_err(|err| BusError::Connection(format!("failed to connect to {servers}: {err}")))?;
        info!(servers = %servers, "connected to message bus");
        Ok(Self { client })
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let request = self.client.request(subject.to_string(), payload.into());
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(message)) => Ok(message.payload.to_vec()),
            Ok(Err(err)) => match err.kind() {
                RequestErrorKind::NoResponders => Err(BusError::NoResponders {
                    subject: subject.to_string(),
                }),
                RequestErrorKind::TimedOut => Err(BusError::timeout(subject, timeout)),
                _ => Err(BusError::Connection(err.to_string())),
            },
            Err(_) => Err(BusError::timeout(subject, timeout)),
        }
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|err| BusError::Connection(err.to_string()))
    }

    async fn subscribe(&self, subject: &str) -> Result<Box<dyn Subscription>, BusError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|err| BusError::Connection(err.to_string()))?;
        Ok(Box::new(NatsSubscription { subscriber }))
    }
}

struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

impl Stream for NatsSubscription {
    type Item = BusMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.subscriber)
            .poll_next(cx)
            .map(|message| {
                message.map(|message| BusMessage {
                    subject: message.subject.to_string(),
                    reply: message.reply.map(|reply| reply.to_string()),
                    payload: message.payload.to_vec(),
                })
            })
    }
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        self.subscriber
            .unsubscribe()
            .await
            .map_err(|err| BusError::Connection(err.to_string()))
    }
}
