use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use replymq::transport::{MemoryTransport, SharedTransport};
use replymq::{OutgoingMessage, Publisher, Subscriber};
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> Result<()> {
    replymq::setup_logger();

    let transport: SharedTransport = Arc::new(MemoryTransport::new());
    let events = transport.create_queue("events", Default::default()).await?;

    let publisher = Publisher::new(transport.clone(), events.clone());

    for i in 0..5 {
        publisher
            .send_message(OutgoingMessage::new(format!("event {i}")))
            .await?;
    }

    // The subscriber hands messages out without acknowledging them, the
    // consumer acks each one after it is done with it.
    let subscriber =
        Subscriber::new(transport.clone(), events.clone()).with_wait_time(Duration::from_millis(200));
    let stream = subscriber.into_stream();
    tokio::pin!(stream);

    let mut seen = 0;
    while let Some(message) = stream.next().await {
        println!("got: {}", message.body);

        transport.delete_message(&events, &message.receipt_handle).await?;

        seen += 1;
        if seen == 5 {
            break;
        }
    }

    Ok(())
}
