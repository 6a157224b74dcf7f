use std::time::Duration;

use anyhow::Result;
use uuid::Uuid;

use crate::message::{AttributeValue, OutgoingMessage};
use crate::publish::Publisher;
use crate::reply::{ReplyQueue, ReplyStatus};

/// One request bound to a reply queue.
///
/// Building the request mints a fresh correlation id, sending it stamps the
/// reply-to and correlation id attributes onto the outgoing message. The
/// consumer copies the id onto its response, which is how
/// [`get_response`](RequestMessage::get_response) finds it again.
pub struct RequestMessage {
    correlation_id: String,
    message: OutgoingMessage,
    reply_queue: ReplyQueue,
}

impl RequestMessage {
    pub fn new(body: impl Into<String>, reply_queue: &ReplyQueue) -> RequestMessage {
        RequestMessage {
            correlation_id: Uuid::new_v4().to_string(),
            message: OutgoingMessage::new(body),
            reply_queue: reply_queue.clone(),
        }
    }

    /// Adds an application attribute to the outgoing message.
    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> RequestMessage {
        self.message = self.message.with_attribute(key, value);
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Sends the request through `publisher`, reply-to and correlation id
    /// attached.
    pub async fn send(&self, publisher: &Publisher) -> Result<()> {
        let message = self
            .message
            .clone()
            .with_reply_to(self.reply_queue.address())
            .with_correlation_id(self.correlation_id.as_str());

        publisher.send_message(message).await
    }

    /// Waits up to `wait` for the response to this request. Can be called
    /// after `send`, or before it from another task when the caller wants
    /// to overlap the two.
    pub async fn get_response(&self, wait: Duration) -> Result<ReplyStatus> {
        self.reply_queue.get_response(&self.correlation_id, wait).await
    }
}
