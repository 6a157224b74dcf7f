//! Request/response messaging on top of one-way queue transports.
//!
//! Queue services deliver messages in one direction only. This crate layers
//! an RPC-shaped conversation on top: a producer owns an ephemeral
//! [`ReplyQueue`], stamps each [`RequestMessage`] with a correlation id and
//! a reply-to attribute, and a consumer-side [`MessagePoller`] publishes
//! the handler's answer back to the queue the request named. Reply queues
//! heartbeat while their owner lives, and a [`Sweeper`] deletes the queues
//! of producers that died without cleaning up.
//!
//! ```no_run
//! use replymq::transport::{MemoryTransport, SharedTransport};
//! use replymq::config::ReplyQueueConfig;
//! use replymq::{Publisher, ReplyQueue, ReplyStatus, RequestMessage};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! async fn call() -> anyhow::Result<()> {
//!     let transport: SharedTransport = Arc::new(MemoryTransport::new());
//!     let work = transport.create_queue("work", Default::default()).await?;
//!
//!     let reply_queue = ReplyQueue::create(transport.clone(), ReplyQueueConfig::default()).await?;
//!     reply_queue.start();
//!
//!     let request = RequestMessage::new(r#"{"op":"ping"}"#, &reply_queue);
//!     request.send(&Publisher::new(transport.clone(), work)).await?;
//!
//!     match request.get_response(Duration::from_secs(5)).await? {
//!         ReplyStatus::Delivered(response) => println!("{}", response.body),
//!         ReplyStatus::TimedOut => println!("nobody answered"),
//!     }
//!
//!     reply_queue.remove_queue().await
//! }
//! ```

pub mod config;

mod dev;

pub use dev::setup_logger;

pub mod error;

mod message;

pub use message::{
    AttributeValue, Attributes, OutgoingMessage, ReceivedMessage, ResponseMessage,
    CORRELATION_ID_KEY, REPLY_TO_KEY,
};

mod poller;

pub use poller::{MessageHandler, MessagePoller, PollerHandle};

mod publish;

pub use publish::Publisher;

mod reply;

pub use reply::{ReplyQueue, ReplyStatus};

mod request;

pub use request::RequestMessage;

mod subscribe;

pub use subscribe::Subscriber;

mod sweeper;

pub use sweeper::{SweepReport, Sweeper, SweeperHandle, TrackingLog, TrackingRecord};

pub mod transport;

#[cfg(test)]
mod tests;
