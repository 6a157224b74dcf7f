mod sweeping;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::ReplyQueueConfig;
use crate::message::{ReceivedMessage, ResponseMessage};
use crate::poller::{MessageHandler, MessagePoller};
use crate::publish::Publisher;
use crate::reply::{ReplyQueue, ReplyStatus};
use crate::transport::{
    MemoryTransport, QueueAddress, QueueAttributes, QueueTransport, SharedTransport,
};

pub use flaky::FlakyTransport;

/// System under test: a shared in-process transport with a short visibility
/// timeout and one work queue requests go to.
pub struct TestCase {
    pub transport: Arc<MemoryTransport>,
    pub work_queue: QueueAddress,
}

impl TestCase {
    pub async fn new() -> TestCase {
        crate::setup_logger();

        let transport = Arc::new(MemoryTransport::with_visibility_timeout(
            Duration::from_millis(300),
        ));
        let work_queue = transport
            .create_queue("work", QueueAttributes::new())
            .await
            .unwrap();

        TestCase {
            transport,
            work_queue,
        }
    }

    pub fn shared(&self) -> SharedTransport {
        self.transport.clone()
    }

    pub async fn reply_queue(&self) -> ReplyQueue {
        ReplyQueue::create(self.shared(), reply_config())
            .await
            .unwrap()
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.shared(), self.work_queue.clone())
    }

    pub fn poller(&self, handler: Arc<dyn MessageHandler>) -> MessagePoller {
        MessagePoller::new(self.shared(), self.work_queue.clone(), handler)
    }
}

/// Unwraps a delivered response and panics on a timeout.
pub fn delivered(status: ReplyStatus) -> ResponseMessage {
    match status {
        ReplyStatus::Delivered(response) => response,
        ReplyStatus::TimedOut => panic!("Expected a delivered response"),
    }
}

/// Reply queue settings tuned for fast tests.
pub fn reply_config() -> ReplyQueueConfig {
    ReplyQueueConfig {
        name: "test-reply".to_string(),
        message_retention_period: 60,
        seconds_before_cleaning: 5,
        num_messages_before_cleaning: 50,
        heartbeat_interval_seconds: 30,
        tracking_queue: "test-tracking".to_string(),
    }
}

/// Parses `{"value": n}` requests and doubles the value.
pub struct DoubleHandler;

#[async_trait]
impl MessageHandler for DoubleHandler {
    async fn process_message(&self, message: &ReceivedMessage) -> Result<String> {
        let request: serde_json::Value = serde_json::from_str(&message.body)?;
        let value = request["value"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("missing value"))?;

        Ok(serde_json::json!({ "status": "ok", "result": value * 2 }).to_string())
    }
}

/// Fails every request.
pub struct FailingHandler;

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn process_message(&self, _message: &ReceivedMessage) -> Result<String> {
        Err(anyhow::anyhow!("boom"))
    }
}

/// Counts handled messages, optionally taking its time over each one.
#[derive(Default)]
pub struct CountingHandler {
    delay: Duration,
    handled: AtomicU32,
}

impl CountingHandler {
    pub fn with_delay(delay: Duration) -> CountingHandler {
        CountingHandler {
            delay,
            handled: AtomicU32::new(0),
        }
    }

    pub fn handled(&self) -> u32 {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn process_message(&self, _message: &ReceivedMessage) -> Result<String> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.handled.fetch_add(1, Ordering::SeqCst);

        Ok("done".to_string())
    }
}
