//! Topic-based publish/subscribe seam.
//!
//! `NatsBroker` is the clustered transport; `MemoryBroker` wires gateway and
//! back-end fakes together inside one process for development and tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use gated_core::error::{GateError, Result};

/// Ordered stream of payloads from one topic.
pub type Subscription = BoxStream<'static, Bytes>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// In-process broker. Delivery order per topic follows publish order;
/// subscribers that fell away are pruned on the next publish.
#[derive(Default)]
pub struct MemoryBroker {
    topics: DashMap<String, Vec<mpsc::UnboundedSender<Bytes>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        if let Some(mut subs) = self.topics.get_mut(topic) {
            subs.retain(|tx| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(topic.to_string()).or_default().push(tx);
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        });
        Ok(stream.boxed())
    }
}

/// NATS-backed broker.
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    /// Connect to a NATS server, optionally with a token.
    pub async fn connect(url: &str, token: Option<&str>) -> Result<Self> {
        let mut opts = async_nats::ConnectOptions::new();
        if let Some(token) = token {
            opts = opts.token(token.to_string());
        }
        opts = opts.retry_on_initial_connect();

        tracing::info!(url = %url, "connecting broker");
        let client = opts
            .connect(url)
            .await
            .map_err(|e| GateError::Transient(format!("nats connect: {e}")))?;
        Ok(Self { client })
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<()> {
        self.client
            .publish(topic.to_string(), payload)
            .await
            .map_err(|e| GateError::Transient(format!("nats publish: {e}")))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let sub = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| GateError::Transient(format!("nats subscribe: {e}")))?;
        Ok(sub.map(|msg| msg.payload).boxed())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("gated/1").await.unwrap();
        let mut b = broker.subscribe("gated/1").await.unwrap();

        broker.publish("gated/1", Bytes::from_static(b"one")).await.unwrap();
        broker.publish("gated/1", Bytes::from_static(b"two")).await.unwrap();

        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(b.next().await.unwrap(), Bytes::from_static(b"one"));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broker = MemoryBroker::new();
        let mut chat = broker.subscribe("svc/chat/3").await.unwrap();
        broker.publish("svc/room/1", Bytes::from_static(b"x")).await.unwrap();
        broker.publish("svc/chat/3", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(chat.next().await.unwrap(), Bytes::from_static(b"y"));
    }
}
