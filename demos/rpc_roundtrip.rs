use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use replymq::config::{ReplyQueueConfig, SweeperConfig};
use replymq::transport::{MemoryTransport, SharedTransport};
use replymq::{
    MessageHandler, MessagePoller, Publisher, ReceivedMessage, ReplyQueue, ReplyStatus,
    RequestMessage, Sweeper,
};

struct Doubler;

#[async_trait]
impl MessageHandler for Doubler {
    async fn process_message(&self, message: &ReceivedMessage) -> Result<String> {
        let request: serde_json::Value = serde_json::from_str(&message.body)?;
        let value = request["value"]
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("missing value"))?;

        Ok(serde_json::json!({ "status": "ok", "result": value * 2 }).to_string())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    replymq::setup_logger();

    let transport: SharedTransport = Arc::new(MemoryTransport::new());
    let work_queue = transport.create_queue("work", Default::default()).await?;

    let poller =
        MessagePoller::new(transport.clone(), work_queue.clone(), Arc::new(Doubler)).start();
    let sweeper = Sweeper::open(transport.clone(), SweeperConfig::default())
        .await?
        .start();

    let reply_queue = ReplyQueue::create(transport.clone(), ReplyQueueConfig::default()).await?;
    reply_queue.start();

    let publisher = Publisher::new(transport.clone(), work_queue);

    let request = RequestMessage::new(r#"{"op":"double","value":21}"#, &reply_queue);
    request.send(&publisher).await?;

    match request.get_response(Duration::from_secs(5)).await? {
        ReplyStatus::Delivered(response) => println!("response: {}", response.body),
        ReplyStatus::TimedOut => println!("no response within 5 seconds"),
    }

    reply_queue.remove_queue().await?;
    poller.stop().await;
    sweeper.stop().await;

    Ok(())
}
