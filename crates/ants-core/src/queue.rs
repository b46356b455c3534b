use crate::error::AntError;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub type MessageHeaders = HashMap<String, String>;

/// One message received from a topic.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

/// Handler invoked for each delivered message.
pub type MessageCallback =
    Arc<dyn Fn(QueueMessage) -> BoxFuture<'static, Result<(), AntError>> + Send + Sync>;

/// Send/subscribe contract of the message bus.
///
/// Shared subscriptions on a topic compete for messages; non-shared
/// subscriptions each receive every message.
#[async_trait::async_trait]
pub trait MessageQueue: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        shared: bool,
        callback: MessageCallback,
    ) -> Result<String, AntError>;

    async fn unsubscribe(&self, topic: &str, id: &str) -> Result<(), AntError>;

    /// Work-queue style delivery. Returns the message id.
    async fn send(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: MessageHeaders,
    ) -> Result<String, AntError>;

    /// Broadcast delivery. Returns the message id.
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: MessageHeaders,
    ) -> Result<String, AntError>;

    async fn close(&self);
}

struct Subscription {
    id: String,
    shared: bool,
    callback: MessageCallback,
}

/// In-process message bus.
///
/// Callbacks run on the publishing task, one after another, in
/// subscription order.
#[derive(Default)]
pub struct ChannelQueue {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    next_shared: AtomicUsize,
    closed: AtomicBool,
}

impl ChannelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    async fn deliver(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: MessageHeaders,
    ) -> Result<String, AntError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AntError::Queue("queue is closed".to_string()));
        }
        let message = QueueMessage {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            payload,
            headers,
        };
        let targets: Vec<MessageCallback> = {
            let topics = self.topics.read().await;
            let Some(subs) = topics.get(topic) else {
                debug!("No subscribers for topic {}", topic);
                return Ok(message.id);
            };
            let mut targets: Vec<MessageCallback> = subs
                .iter()
                .filter(|s| !s.shared)
                .map(|s| s.callback.clone())
                .collect();
            let shared: Vec<&Subscription> = subs.iter().filter(|s| s.shared).collect();
            if !shared.is_empty() {
                let next = self.next_shared.fetch_add(1, Ordering::SeqCst) % shared.len();
                targets.push(shared[next].callback.clone());
            }
            targets
        };
        for callback in targets {
            if let Err(e) = callback(message.clone()).await {
                warn!("Subscriber of {} failed to handle message {}: {}", topic, message.id, e);
            }
        }
        Ok(message.id)
    }
}

#[async_trait::async_trait]
impl MessageQueue for ChannelQueue {
    async fn subscribe(
        &self,
        topic: &str,
        shared: bool,
        callback: MessageCallback,
    ) -> Result<String, AntError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AntError::Queue("queue is closed".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(Subscription {
                id: id.clone(),
                shared,
                callback,
            });
        debug!("Subscribed {} to {} (shared={})", id, topic, shared);
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: &str) -> Result<(), AntError> {
        let mut topics = self.topics.write().await;
        let subs = topics
            .get_mut(topic)
            .ok_or_else(|| AntError::NotFound(format!("topic {}", topic)))?;
        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(AntError::NotFound(format!("subscription {} on {}", id, topic)));
        }
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: MessageHeaders,
    ) -> Result<String, AntError> {
        self.deliver(topic, payload, headers).await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: MessageHeaders,
    ) -> Result<String, AntError> {
        self.deliver(topic, payload, headers).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.topics.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(name: &'static str, log: Arc<Mutex<Vec<String>>>) -> MessageCallback {
        Arc::new(move |msg: QueueMessage| -> BoxFuture<'static, Result<(), AntError>> {
            let log = log.clone();
            Box::pin(async move {
                log.lock()
                    .unwrap()
                    .push(format!("{}:{}", name, String::from_utf8_lossy(&msg.payload)));
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn test_non_shared_subscribers_all_receive() {
        let queue = ChannelQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.subscribe("t", false, recorder("a", log.clone())).await.unwrap();
        queue.subscribe("t", false, recorder("b", log.clone())).await.unwrap();
        queue.publish("t", b"1".to_vec(), HashMap::new()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a:1", "b:1"]);
    }

    #[tokio::test]
    async fn test_shared_subscribers_round_robin() {
        let queue = ChannelQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        queue.subscribe("t", true, recorder("a", log.clone())).await.unwrap();
        queue.subscribe("t", true, recorder("b", log.clone())).await.unwrap();
        for i in 0..4 {
            queue.send("t", i.to_string().into_bytes(), HashMap::new()).await.unwrap();
        }
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 4);
        assert_eq!(log.iter().filter(|l| l.starts_with("a:")).count(), 2);
        assert_eq!(log.iter().filter(|l| l.starts_with("b:")).count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let queue = ChannelQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = queue.subscribe("t", false, recorder("a", log.clone())).await.unwrap();
        queue.unsubscribe("t", &id).await.unwrap();
        assert!(queue.unsubscribe("t", &id).await.is_err());
        queue.publish("t", b"x".to_vec(), HashMap::new()).await.unwrap();
        assert!(log.lock().unwrap().is_empty());

        queue.close().await;
        assert!(queue.publish("t", b"x".to_vec(), HashMap::new()).await.is_err());
    }
}
