//! In-process queue transport.
//!
//! Backs the tests and demos, and is good enough for single-process
//! deployments. Semantics follow hosted queue services: receive hides a
//! message for the visibility timeout instead of removing it, so an
//! unacknowledged message comes back, and long polls return as soon as a
//! message arrives.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::RpcErrorKind;
use crate::message::{Attributes, ReceivedMessage};
use crate::rpc_error;
use crate::transport::{
    QueueAddress, QueueAttributes, QueueTransport, ATTR_RETENTION_PERIOD, ATTR_VISIBILITY_TIMEOUT,
};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_RETENTION_PERIOD: Duration = Duration::from_secs(345_600);
const MAX_RECEIVE_BATCH: usize = 10;

const ADDRESS_SCHEME: &str = "memory://";

struct StoredMessage {
    id: String,
    body: String,
    attributes: Attributes,
    receipt_handle: String,
    sent_at: Instant,
    invisible_until: Option<Instant>,
}

struct QueueEntry {
    attributes: QueueAttributes,
    messages: VecDeque<StoredMessage>,
    arrived: Arc<Notify>,
    visibility_timeout: Duration,
    retention_period: Duration,
}

impl QueueEntry {
    fn new(attributes: QueueAttributes, default_visibility: Duration) -> QueueEntry {
        let mut entry = QueueEntry {
            attributes,
            messages: VecDeque::new(),
            arrived: Arc::new(Notify::new()),
            visibility_timeout: default_visibility,
            retention_period: DEFAULT_RETENTION_PERIOD,
        };

        entry.apply_attributes();
        entry
    }

    /// Re-reads the durations controlled by queue attributes.
    fn apply_attributes(&mut self) {
        if let Some(visibility) = parse_seconds(&self.attributes, ATTR_VISIBILITY_TIMEOUT) {
            self.visibility_timeout = visibility;
        }

        if let Some(retention) = parse_seconds(&self.attributes, ATTR_RETENTION_PERIOD) {
            self.retention_period = retention;
        }
    }

    fn drop_expired(&mut self, now: Instant) {
        let retention = self.retention_period;

        self.messages
            .retain(|stored| now.duration_since(stored.sent_at) < retention);
    }

    /// Hands out up to `max` visible messages, hiding each for the
    /// visibility timeout under a fresh receipt handle.
    fn take_visible(&mut self, max: usize, now: Instant) -> Vec<ReceivedMessage> {
        let visibility = self.visibility_timeout;
        let mut batch = Vec::new();

        for stored in self.messages.iter_mut() {
            if batch.len() >= max {
                break;
            }

            if stored.invisible_until.is_some_and(|until| until > now) {
                continue;
            }

            stored.invisible_until = Some(now + visibility);
            stored.receipt_handle = Uuid::new_v4().to_string();

            batch.push(ReceivedMessage {
                id: stored.id.clone(),
                body: stored.body.clone(),
                attributes: stored.attributes.clone(),
                receipt_handle: stored.receipt_handle.clone(),
            });
        }

        batch
    }

    /// When the next hidden message becomes visible again, if any.
    fn next_visible_at(&self) -> Option<Instant> {
        self.messages
            .iter()
            .filter_map(|stored| stored.invisible_until)
            .min()
    }
}

/// Queue transport living in the process memory.
pub struct MemoryTransport {
    queues: Mutex<HashMap<String, QueueEntry>>,
    default_visibility: Duration,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        MemoryTransport::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// A transport whose queues hide received messages for `visibility`
    /// unless the queue overrides it. Short values make redelivery tests
    /// fast.
    pub fn with_visibility_timeout(visibility: Duration) -> MemoryTransport {
        MemoryTransport {
            queues: Mutex::new(HashMap::new()),
            default_visibility: visibility,
        }
    }

    /// Number of messages on the queue, visible or not.
    pub async fn queue_depth(&self, queue: &QueueAddress) -> Option<usize> {
        let queues = self.queues.lock().await;

        queues.get(queue_name(queue)).map(|entry| entry.messages.len())
    }
}

impl Default for MemoryTransport {
    fn default() -> MemoryTransport {
        MemoryTransport::new()
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    async fn create_queue(&self, name: &str, attributes: QueueAttributes) -> Result<QueueAddress> {
        let mut queues = self.queues.lock().await;

        if queues.contains_key(name) {
            return rpc_error!(RpcErrorKind::Provisioning, name, "queue name already taken");
        }

        queues.insert(
            name.to_string(),
            QueueEntry::new(attributes, self.default_visibility),
        );

        Ok(QueueAddress::new(format!("{ADDRESS_SCHEME}{name}")))
    }

    async fn delete_queue(&self, queue: &QueueAddress) -> Result<()> {
        let mut queues = self.queues.lock().await;

        match queues.remove(queue_name(queue)) {
            Some(_) => Ok(()),
            None => rpc_error!(RpcErrorKind::NotFound, queue.as_str(), "no such queue"),
        }
    }

    async fn get_queue(&self, name: &str) -> Result<Option<QueueAddress>> {
        let queues = self.queues.lock().await;

        Ok(queues
            .contains_key(name)
            .then(|| QueueAddress::new(format!("{ADDRESS_SCHEME}{name}"))))
    }

    async fn send(&self, queue: &QueueAddress, body: String, attributes: Attributes) -> Result<()> {
        let mut queues = self.queues.lock().await;

        let entry = match queues.get_mut(queue_name(queue)) {
            Some(entry) => entry,
            None => return rpc_error!(RpcErrorKind::NotFound, queue.as_str(), "no such queue"),
        };

        entry.messages.push_back(StoredMessage {
            id: Uuid::new_v4().to_string(),
            body,
            attributes,
            receipt_handle: Uuid::new_v4().to_string(),
            sent_at: Instant::now(),
            invisible_until: None,
        });
        entry.arrived.notify_one();

        Ok(())
    }

    async fn receive(
        &self,
        queue: &QueueAddress,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + wait;

        loop {
            let (batch, arrived, next_visible) = {
                let mut queues = self.queues.lock().await;

                let entry = match queues.get_mut(queue_name(queue)) {
                    Some(entry) => entry,
                    None => return rpc_error!(RpcErrorKind::NotFound, queue.as_str(), "no such queue"),
                };

                let now = Instant::now();
                entry.drop_expired(now);

                let batch = entry.take_visible(max_messages.min(MAX_RECEIVE_BATCH), now);

                (batch, entry.arrived.clone(), entry.next_visible_at())
            };

            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            // Wake on arrival, on the next visibility lapse or at the poll
            // deadline, whichever comes first.
            let mut wake_at = deadline;
            if let Some(at) = next_visible {
                wake_at = wake_at.min(at);
            }

            let _ = tokio::time::timeout(wake_at - now, arrived.notified()).await;
        }
    }

    async fn delete_message(&self, queue: &QueueAddress, receipt_handle: &str) -> Result<()> {
        let mut queues = self.queues.lock().await;

        let entry = match queues.get_mut(queue_name(queue)) {
            Some(entry) => entry,
            None => return rpc_error!(RpcErrorKind::NotFound, queue.as_str(), "no such queue"),
        };

        let before = entry.messages.len();
        entry
            .messages
            .retain(|stored| stored.receipt_handle != receipt_handle);

        if entry.messages.len() == before {
            return rpc_error!(
                RpcErrorKind::NotFound,
                queue.as_str(),
                "no message for receipt handle"
            );
        }

        Ok(())
    }

    async fn queue_attributes(&self, queue: &QueueAddress) -> Result<QueueAttributes> {
        let queues = self.queues.lock().await;

        match queues.get(queue_name(queue)) {
            Some(entry) => Ok(entry.attributes.clone()),
            None => rpc_error!(RpcErrorKind::NotFound, queue.as_str(), "no such queue"),
        }
    }

    async fn set_queue_attributes(
        &self,
        queue: &QueueAddress,
        attributes: QueueAttributes,
    ) -> Result<()> {
        let mut queues = self.queues.lock().await;

        let entry = match queues.get_mut(queue_name(queue)) {
            Some(entry) => entry,
            None => return rpc_error!(RpcErrorKind::NotFound, queue.as_str(), "no such queue"),
        };

        entry.attributes.extend(attributes);
        entry.apply_attributes();

        Ok(())
    }
}

fn queue_name(queue: &QueueAddress) -> &str {
    queue
        .as_str()
        .strip_prefix(ADDRESS_SCHEME)
        .unwrap_or(queue.as_str())
}

fn parse_seconds(attributes: &QueueAttributes, key: &str) -> Option<Duration> {
    attributes
        .get(key)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::to_rpc_error;

    async fn transport_with_queue(visibility: Duration) -> (MemoryTransport, QueueAddress) {
        let transport = MemoryTransport::with_visibility_timeout(visibility);
        let queue = transport
            .create_queue("jobs", QueueAttributes::new())
            .await
            .unwrap();

        (transport, queue)
    }

    #[tokio::test]
    async fn long_poll_returns_early_on_arrival() {
        let (transport, queue) = transport_with_queue(Duration::from_secs(30)).await;
        let transport = Arc::new(transport);

        let sender = transport.clone();
        let destination = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender
                .send(&destination, "hello".to_string(), Attributes::new())
                .await
                .unwrap();
        });

        let started = Instant::now();
        let batch = transport
            .receive(&queue, 10, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].body, "hello");
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn idle_long_poll_returns_empty() {
        let (transport, queue) = transport_with_queue(Duration::from_secs(30)).await;

        let batch = transport
            .receive(&queue, 10, Duration::from_millis(50))
            .await
            .unwrap();

        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn unacknowledged_message_is_redelivered() {
        let (transport, queue) = transport_with_queue(Duration::from_millis(100)).await;

        transport
            .send(&queue, "retry me".to_string(), Attributes::new())
            .await
            .unwrap();

        let first = transport.receive(&queue, 10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        // Hidden while the visibility timeout runs.
        let hidden = transport.receive(&queue, 10, Duration::ZERO).await.unwrap();
        assert!(hidden.is_empty());

        let second = transport
            .receive(&queue, 10, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test]
    async fn acknowledged_message_is_gone() {
        let (transport, queue) = transport_with_queue(Duration::from_millis(100)).await;

        transport
            .send(&queue, "done".to_string(), Attributes::new())
            .await
            .unwrap();

        let batch = transport.receive(&queue, 10, Duration::ZERO).await.unwrap();
        transport
            .delete_message(&queue, &batch[0].receipt_handle)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        let after = transport.receive(&queue, 10, Duration::ZERO).await.unwrap();
        assert!(after.is_empty());
        assert_eq!(transport.queue_depth(&queue).await, Some(0));
    }

    #[tokio::test]
    async fn stale_receipt_handle_is_rejected() {
        let (transport, queue) = transport_with_queue(Duration::from_millis(50)).await;

        transport
            .send(&queue, "slow".to_string(), Attributes::new())
            .await
            .unwrap();

        let first = transport.receive(&queue, 10, Duration::ZERO).await.unwrap();
        let second = transport
            .receive(&queue, 10, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.len(), 1);

        let result = transport
            .delete_message(&queue, &first[0].receipt_handle)
            .await;

        assert_eq!(
            to_rpc_error(result.unwrap_err()).kind,
            RpcErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn queue_name_collision_is_rejected() {
        let transport = MemoryTransport::new();
        transport
            .create_queue("taken", QueueAttributes::new())
            .await
            .unwrap();

        let result = transport.create_queue("taken", QueueAttributes::new()).await;

        assert_eq!(
            to_rpc_error(result.unwrap_err()).kind,
            RpcErrorKind::Provisioning
        );
    }

    #[tokio::test]
    async fn retention_drops_old_messages() {
        let transport = MemoryTransport::new();
        let mut attributes = QueueAttributes::new();
        attributes.insert(ATTR_RETENTION_PERIOD.to_string(), "1".to_string());
        let queue = transport.create_queue("short", attributes).await.unwrap();

        transport
            .send(&queue, "fading".to_string(), Attributes::new())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let batch = transport.receive(&queue, 10, Duration::ZERO).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn attributes_merge_on_update() {
        let (transport, queue) = transport_with_queue(Duration::from_secs(30)).await;

        let mut update = QueueAttributes::new();
        update.insert("last_heartbeat".to_string(), "1700000000".to_string());
        transport.set_queue_attributes(&queue, update).await.unwrap();

        let attributes = transport.queue_attributes(&queue).await.unwrap();
        assert_eq!(
            attributes.get("last_heartbeat").map(String::as_str),
            Some("1700000000")
        );
    }
}
