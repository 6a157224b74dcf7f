use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use replymq::config::ReplyQueueConfig;
use replymq::transport::{MemoryTransport, SharedTransport};
use replymq::{OutgoingMessage, ReplyQueue, ReplyStatus};

/// Latency of one response hop: send onto the reply queue, collect,
/// correlate, hand to the waiter.
fn response_roundtrip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let transport: SharedTransport = Arc::new(MemoryTransport::new());
    let reply_queue = rt.block_on(async {
        let queue = ReplyQueue::create(transport.clone(), ReplyQueueConfig::default())
            .await
            .unwrap();
        queue.start();

        queue
    });
    let address = reply_queue.address().clone();

    let mut n = 0u64;
    c.bench_function("response_roundtrip", |b| {
        b.iter(|| {
            n += 1;
            let correlation_id = format!("bench-{n}");

            rt.block_on(async {
                let response =
                    OutgoingMessage::new("pong").with_correlation_id(correlation_id.clone());

                transport
                    .send(&address, response.body, response.attributes)
                    .await
                    .unwrap();

                match reply_queue
                    .get_response(&correlation_id, Duration::from_secs(1))
                    .await
                    .unwrap()
                {
                    ReplyStatus::Delivered(_) => {}
                    ReplyStatus::TimedOut => panic!("response lost"),
                }
            });
        })
    });
}

criterion_group!(benches, response_roundtrip);
criterion_main!(benches);
