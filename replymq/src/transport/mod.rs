//! Seam between the messaging layer and the queue service it runs on.
//!
//! Everything above this module talks to queues through [`QueueTransport`],
//! so the orchestration logic never knows whether messages travel through
//! the in-process [`MemoryTransport`] or a remote queue service.

pub mod memory;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::message::{Attributes, ReceivedMessage};

pub use memory::MemoryTransport;

/// Queue attribute key, message retention in seconds.
pub const ATTR_RETENTION_PERIOD: &str = "message_retention_period";
/// Queue attribute key, how long a received message stays invisible to
/// other receivers, in seconds.
pub const ATTR_VISIBILITY_TIMEOUT: &str = "visibility_timeout";
/// Queue attribute key, unix timestamp of the owner's last heartbeat.
pub const ATTR_LAST_HEARTBEAT: &str = "last_heartbeat";

/// Transport-level identity of a queue. Opaque to this crate, the built-in
/// transport uses `memory://<name>` URLs.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct QueueAddress(String);

impl QueueAddress {
    pub fn new(address: impl Into<String>) -> QueueAddress {
        QueueAddress(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for QueueAddress {
    fn from(address: String) -> QueueAddress {
        QueueAddress(address)
    }
}

/// String-keyed queue attributes, see the `ATTR_` constants.
pub type QueueAttributes = HashMap<String, String>;

/// A queue service with at-least-once delivery.
///
/// Implementations must honor the visibility timeout on receive: a received
/// message stays on the queue, hidden from other receivers, until it is
/// acknowledged with [`delete_message`](QueueTransport::delete_message) or
/// the timeout lapses and the message becomes receivable again.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Creates a queue and returns its address. Fails when the name is
    /// already taken.
    async fn create_queue(&self, name: &str, attributes: QueueAttributes) -> Result<QueueAddress>;

    /// Deletes a queue together with all messages still on it.
    async fn delete_queue(&self, queue: &QueueAddress) -> Result<()>;

    /// Looks up a queue by name.
    async fn get_queue(&self, name: &str) -> Result<Option<QueueAddress>>;

    /// Enqueues one message.
    async fn send(&self, queue: &QueueAddress, body: String, attributes: Attributes) -> Result<()>;

    /// Receives up to `max_messages`, long polling up to `wait`. Returns
    /// early as soon as at least one message is available, an empty vec
    /// after an idle wait.
    async fn receive(
        &self,
        queue: &QueueAddress,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledges a received message so it is never delivered again.
    async fn delete_message(&self, queue: &QueueAddress, receipt_handle: &str) -> Result<()>;

    async fn queue_attributes(&self, queue: &QueueAddress) -> Result<QueueAttributes>;

    /// Merges the given keys into the queue attributes.
    async fn set_queue_attributes(
        &self,
        queue: &QueueAddress,
        attributes: QueueAttributes,
    ) -> Result<()>;
}

pub type SharedTransport = Arc<dyn QueueTransport>;
