//! Publish/subscribe seam for cross-instance fan-out.
//!
//! Every room subscribes to the broker topic named by its own id, and every
//! publish reaches local members the same way it reaches remote ones:
//! through the broker round-trip. The trait is the plug point for an
//! external broker client; [`InProcessBroker`] backs single-process
//! deployments and lets tests share one broker between several hubs.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use log::warn;
use tokio::sync::{broadcast, mpsc};

/// Per-topic delivery buffer.
const TOPIC_BUFFER: usize = 256;

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Publish a payload to a topic. Publishing to a topic nobody
    /// subscribes to is a no-op, not an error.
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Open a subscription that delivers every payload published to
    /// `topic` after this call, in publish order.
    async fn subscribe(&self, topic: &str) -> anyhow::Result<Subscription>;
}

/// A live broker subscription. Dropping it ends delivery.
pub struct Subscription {
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Next payload, or `None` once the broker side is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Broker for a single process: one `broadcast` channel per topic, indexed
/// by topic name. Hubs that should observe each other's publishes share one
/// value behind `Arc`.
#[derive(Default)]
pub struct InProcessBroker {
    topics: DashMap<String, broadcast::Sender<Bytes>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_BUFFER).0)
            .clone()
    }
}

#[async_trait]
impl Broker for InProcessBroker {
    async fn publish(&self, topic: &str, payload: Bytes) -> anyhow::Result<()> {
        // send only errors when there are no subscribers
        let _ = self.topic(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> anyhow::Result<Subscription> {
        let mut source = self.topic(topic).subscribe();
        let (tx, rx) = mpsc::channel(TOPIC_BUFFER);
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("subscription to {topic} lagged, {skipped} message(s) skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription::new(rx))
    }
}
