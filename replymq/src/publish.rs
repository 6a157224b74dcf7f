use std::time::Duration;

use anyhow::Result;
use log::{debug, warn};

use crate::error::{to_rpc_error, RpcErrorKind};
use crate::message::OutgoingMessage;
use crate::transport::{QueueAddress, SharedTransport};

const MAX_SEND_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Sends messages to one queue.
///
/// Transient transport failures are retried a few times with a growing
/// backoff. Everything else, including exhausted retries, surfaces as a
/// [`Publish`](RpcErrorKind::Publish) error, further retry policy is the
/// caller's call.
#[derive(Clone)]
pub struct Publisher {
    transport: SharedTransport,
    queue: QueueAddress,
}

impl Publisher {
    pub fn new(transport: SharedTransport, queue: QueueAddress) -> Publisher {
        Publisher { transport, queue }
    }

    pub fn queue(&self) -> &QueueAddress {
        &self.queue
    }

    pub async fn send_message(&self, message: OutgoingMessage) -> Result<()> {
        let mut attempt = 1u32;

        loop {
            let sent = self
                .transport
                .send(&self.queue, message.body.clone(), message.attributes.clone())
                .await;

            match sent {
                Ok(()) => {
                    debug!("Sent message to {}", self.queue);

                    return Ok(());
                }
                Err(e) => {
                    let failure = to_rpc_error(e);

                    if failure.kind == RpcErrorKind::Transport && attempt < MAX_SEND_ATTEMPTS {
                        warn!(
                            "Send to {} failed on attempt {}, retrying: {}",
                            self.queue, attempt, failure
                        );

                        tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                        attempt += 1;

                        continue;
                    }

                    return RpcErrorKind::Publish.into_result(
                        Some(self.queue.as_str()),
                        &format!("giving up after {} attempts: {}", attempt, failure),
                    );
                }
            }
        }
    }
}
