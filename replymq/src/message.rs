//! Message model shared by producers and consumers.
//!
//! A message is an opaque body plus a map of typed attributes. Two attribute
//! keys are reserved for the request/response protocol: [`REPLY_TO_KEY`]
//! names the queue the response should be sent to, [`CORRELATION_ID_KEY`]
//! carries the producer-generated id that pairs a response with its request.

use std::collections::HashMap;
use std::fmt;

use crate::transport::QueueAddress;

/// Attribute key naming the queue responses should be sent to.
pub const REPLY_TO_KEY: &str = "reply_to";
/// Attribute key carrying the correlation id of a request.
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Typed attribute value, a type tag plus its string representation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AttributeValue {
    pub data_type: String,
    pub value: String,
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> AttributeValue {
        AttributeValue {
            data_type: "String".to_string(),
            value: value.into(),
        }
    }

    pub fn number(value: impl ToString) -> AttributeValue {
        AttributeValue {
            data_type: "Number".to_string(),
            value: value.to_string(),
        }
    }
}

pub type Attributes = HashMap<String, AttributeValue>;

/// A message to be sent, built up with the `with_` helpers.
#[derive(Clone, Default)]
pub struct OutgoingMessage {
    pub body: String,
    pub attributes: Attributes,
}

impl OutgoingMessage {
    pub fn new(body: impl Into<String>) -> OutgoingMessage {
        OutgoingMessage {
            body: body.into(),
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> OutgoingMessage {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn with_reply_to(self, queue: &QueueAddress) -> OutgoingMessage {
        self.with_attribute(REPLY_TO_KEY, AttributeValue::string(queue.as_str()))
    }

    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> OutgoingMessage {
        self.with_attribute(CORRELATION_ID_KEY, AttributeValue::string(correlation_id))
    }
}

impl fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("body", &truncate(&self.body))
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// A message received from a queue, along with the receipt handle the
/// consumer needs to acknowledge it.
#[derive(Clone)]
pub struct ReceivedMessage {
    pub id: String,
    pub body: String,
    pub attributes: Attributes,
    pub receipt_handle: String,
}

impl ReceivedMessage {
    pub fn correlation_id(&self) -> Option<&str> {
        self.attributes
            .get(CORRELATION_ID_KEY)
            .map(|attribute| attribute.value.as_str())
    }

    pub fn reply_to(&self) -> Option<QueueAddress> {
        self.attributes
            .get(REPLY_TO_KEY)
            .map(|attribute| QueueAddress::new(attribute.value.clone()))
    }
}

impl fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("id", &self.id)
            .field("body", &truncate(&self.body))
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// A response delivered to the requester, keyed by the correlation id it was
/// sent back with.
#[derive(Clone)]
pub struct ResponseMessage {
    pub correlation_id: String,
    pub body: String,
    pub attributes: Attributes,
}

impl ResponseMessage {
    /// Reads a received message as a response. `None` when the correlation
    /// id attribute is missing, such a message cannot be routed to a waiter.
    pub fn from_received(message: ReceivedMessage) -> Option<ResponseMessage> {
        let correlation_id = message.correlation_id()?.to_string();

        Some(ResponseMessage {
            correlation_id,
            body: message.body,
            attributes: message.attributes,
        })
    }
}

impl fmt::Debug for ResponseMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseMessage")
            .field("correlation_id", &self.correlation_id)
            .field("body", &truncate(&self.body))
            .finish()
    }
}

/// First 64 characters of a body, so debug logs stay readable.
fn truncate(body: &str) -> String {
    let end = body
        .char_indices()
        .nth(64)
        .map(|(at, _)| at)
        .unwrap_or(body.len());

    body[..end].to_string()
}
