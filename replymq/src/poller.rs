//! Consumer-side run loop.
//!
//! A [`MessagePoller`] drives the receive, handle, reply, acknowledge cycle
//! against one request queue. Several pollers may serve the same queue, the
//! visibility timeout of the transport keeps them from handling the same
//! message at once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{error, info, trace, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RpcError, RpcErrorKind};
use crate::logerr;
use crate::message::{OutgoingMessage, ReceivedMessage};
use crate::publish::Publisher;
use crate::subscribe::Subscriber;
use crate::transport::{QueueAddress, SharedTransport};

const RECEIVE_FAILURE_BACKOFF: Duration = Duration::from_millis(500);

/// Application logic processing one request.
///
/// The returned string becomes the response body. An error is turned into
/// an error-status response and the request still counts as handled, a
/// failing handler does not put the message back on the queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn process_message(&self, message: &ReceivedMessage) -> Result<String>;
}

/// Receives requests, runs the handler, publishes the response to the
/// queue named by the reply-to attribute and acknowledges the request.
///
/// A request is acknowledged only after its response was published, so a
/// crash in between redelivers the request. Consumers see at-least-once
/// delivery and have to tolerate duplicates.
pub struct MessagePoller {
    transport: SharedTransport,
    subscriber: Subscriber,
    handler: Arc<dyn MessageHandler>,
    cancel: CancellationToken,
}

impl MessagePoller {
    pub fn new(
        transport: SharedTransport,
        queue: QueueAddress,
        handler: Arc<dyn MessageHandler>,
    ) -> MessagePoller {
        let subscriber = Subscriber::new(transport.clone(), queue);

        MessagePoller {
            transport,
            subscriber,
            handler,
            cancel: CancellationToken::new(),
        }
    }

    /// Spawns the run loop on its own task.
    pub fn start(self) -> PollerHandle {
        let cancel = self.cancel.clone();
        let join = tokio::spawn(self.run());

        PollerHandle { cancel, join }
    }

    /// Drives the loop on the caller's task until stopped. A stop request
    /// lets the batch in flight finish first.
    pub async fn run(self) {
        info!("Poller started on {}", self.subscriber.queue());

        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.subscriber.receive_batch() => received,
            };

            match received {
                Ok(batch) => {
                    for message in batch {
                        self.process(message).await;
                    }
                }
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }

                    error!("Receive on {} failed: {:?}", self.subscriber.queue(), e);

                    tokio::time::sleep(RECEIVE_FAILURE_BACKOFF).await;
                }
            }
        }

        info!("Poller on {} stopped", self.subscriber.queue());
    }

    async fn process(&self, message: ReceivedMessage) {
        trace!("Handling {:?}", message);

        let body = match self.handler.process_message(&message).await {
            Ok(body) => body,
            Err(e) => {
                let failure = RpcErrorKind::Handler.into_error(None, &format!("{e:#}"));

                warn!("Handler failed for message {}: {}", message.id, failure);

                error_response(&failure)
            }
        };

        match message.reply_to() {
            Some(reply_queue) => {
                let publisher = Publisher::new(self.transport.clone(), reply_queue);
                let mut response = OutgoingMessage::new(body);

                if let Some(correlation_id) = message.correlation_id() {
                    response = response.with_correlation_id(correlation_id);
                }

                if let Err(e) = publisher.send_message(response).await {
                    error!(
                        "Cannot publish response for message {}, leaving it unacknowledged: {:?}",
                        message.id, e
                    );

                    // Redelivered once the visibility timeout lapses.
                    return;
                }
            }
            None => trace!("Message {} is one-way, nothing to reply to", message.id),
        }

        logerr!(
            self.transport
                .delete_message(self.subscriber.queue(), &message.receipt_handle)
                .await
        );
    }
}

/// Handle of a spawned poller.
pub struct PollerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Asks the loop to stop and waits until in-flight handling finished.
    pub async fn stop(self) {
        self.cancel.cancel();

        logerr!(self.join.await);
    }
}

/// Error-status response body sent back when the handler fails.
fn error_response(failure: &RpcError) -> String {
    serde_json::json!({
        "status": "error",
        "error": failure.message,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_the_detail() {
        let failure = RpcErrorKind::Handler.into_error(None, "parse failed: missing field op");

        let body: serde_json::Value = serde_json::from_str(&error_response(&failure)).unwrap();

        assert_eq!(body["status"], "error");
        assert_eq!(body["error"], "parse failed: missing field op");
    }
}
