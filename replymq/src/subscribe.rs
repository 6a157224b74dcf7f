use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use futures::Stream;
use log::{error, trace, warn};

use crate::error::{to_rpc_error, RpcErrorKind};
use crate::message::ReceivedMessage;
use crate::transport::{QueueAddress, SharedTransport};

const LONG_POLL_WAIT: Duration = Duration::from_secs(10);
const MAX_BATCH: usize = 10;
const MAX_RECEIVE_ATTEMPTS: u32 = 3;
const RECEIVE_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Receives messages from one queue with long polling.
///
/// The subscriber never deletes what it hands out. Acknowledging a message
/// after it has been handled is the caller's responsibility, an unhandled
/// message reappears once its visibility timeout lapses.
#[derive(Clone)]
pub struct Subscriber {
    transport: SharedTransport,
    queue: QueueAddress,
    wait_time: Duration,
}

impl Subscriber {
    pub fn new(transport: SharedTransport, queue: QueueAddress) -> Subscriber {
        Subscriber {
            transport,
            queue,
            wait_time: LONG_POLL_WAIT,
        }
    }

    /// Overrides the long poll wait of [`receive_batch`](Subscriber::receive_batch).
    pub fn with_wait_time(mut self, wait_time: Duration) -> Subscriber {
        self.wait_time = wait_time;
        self
    }

    pub fn queue(&self) -> &QueueAddress {
        &self.queue
    }

    /// One long poll against the queue. An empty batch is the normal idle
    /// outcome, transient transport failures are retried before giving up.
    pub async fn receive_batch(&self) -> Result<Vec<ReceivedMessage>> {
        let mut attempt = 1u32;

        loop {
            match self.transport.receive(&self.queue, MAX_BATCH, self.wait_time).await {
                Ok(batch) => {
                    if !batch.is_empty() {
                        trace!("Received {} messages from {}", batch.len(), self.queue);
                    }

                    return Ok(batch);
                }
                Err(e) => {
                    let failure = to_rpc_error(e);

                    if failure.kind == RpcErrorKind::Transport && attempt < MAX_RECEIVE_ATTEMPTS {
                        warn!(
                            "Receive from {} failed on attempt {}, retrying: {}",
                            self.queue, attempt, failure
                        );

                        tokio::time::sleep(RECEIVE_RETRY_BACKOFF).await;
                        attempt += 1;

                        continue;
                    }

                    return Err(failure.into());
                }
            }
        }
    }

    /// Turns the subscriber into a lazy, endless stream of messages.
    ///
    /// The queue is polled only while the stream is being consumed. Receive
    /// failures are logged and polling continues, so a consumer loop
    /// survives transport hiccups.
    pub fn into_stream(self) -> impl Stream<Item = ReceivedMessage> {
        futures::stream::unfold(
            (self, VecDeque::new()),
            |(subscriber, mut buffered)| async move {
                loop {
                    if let Some(message) = buffered.pop_front() {
                        return Some((message, (subscriber, buffered)));
                    }

                    match subscriber.receive_batch().await {
                        Ok(batch) => buffered.extend(batch),
                        Err(e) => {
                            error!("Receive from {} failed: {:?}", subscriber.queue, e);

                            tokio::time::sleep(RECEIVE_RETRY_BACKOFF).await;
                        }
                    }
                }
            },
        )
    }
}
