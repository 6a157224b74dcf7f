//! Ephemeral reply queues on the producer side.
//!
//! A [`ReplyQueue`] is created per producer, carries a random name suffix
//! and lives only as long as its owner. Once started it runs two background
//! tasks: a collector that drains incoming responses into the correlation
//! map, and a heartbeat that refreshes the queue attributes and the
//! tracking log so the sweeper leaves the queue alone. A queue whose
//! heartbeat keeps failing declares itself unhealthy and fails every
//! waiter, fresh state has to come from a new queue.

pub(crate) mod correlation;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, trace, warn};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ReplyQueueConfig;
use crate::error::{to_rpc_error, RpcErrorKind};
use crate::logerr;
use crate::message::{ReceivedMessage, ResponseMessage};
use crate::reply::correlation::{ReplyMap, WaitSlot};
use crate::sweeper::{unix_now, TrackingLog, TrackingRecord};
use crate::transport::{
    QueueAddress, QueueAttributes, SharedTransport, ATTR_LAST_HEARTBEAT, ATTR_RETENTION_PERIOD,
};

/// Messages fetched per collector poll.
const COLLECT_BATCH: usize = 10;
/// Long poll wait of one collector pass.
const COLLECT_WAIT: Duration = Duration::from_millis(500);
/// Consecutive heartbeat failures tolerated before the queue gives up.
const MAX_HEARTBEAT_FAILURES: u32 = 3;

/// Outcome of waiting for a response.
///
/// A missing response within the caller's deadline is an expected outcome
/// of the protocol, not an error, so it has its own variant instead of an
/// error type.
#[derive(Debug)]
pub enum ReplyStatus {
    /// The response correlated with the request arrived.
    Delivered(ResponseMessage),
    /// Nothing arrived in time. A response showing up later is parked and
    /// eventually evicted, nobody is waiting anymore.
    TimedOut,
}

struct ReplyQueueInner {
    name: String,
    address: QueueAddress,
    transport: SharedTransport,
    config: ReplyQueueConfig,
    replies: ReplyMap,
    tracking: TrackingLog,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    removed: AtomicBool,
}

/// Producer-owned queue responses come back on. Cheap to clone, clones
/// share the queue and its correlation map.
#[derive(Clone)]
pub struct ReplyQueue {
    inner: Arc<ReplyQueueInner>,
}

impl ReplyQueue {
    /// Provisions the queue under a random name built from the configured
    /// prefix and announces it on the tracking log.
    pub async fn create(transport: SharedTransport, config: ReplyQueueConfig) -> Result<ReplyQueue> {
        let name = format!("{}-{}", config.name, Uuid::new_v4().simple());

        let mut attributes = QueueAttributes::new();
        attributes.insert(
            ATTR_RETENTION_PERIOD.to_string(),
            config.message_retention_period.to_string(),
        );
        attributes.insert(ATTR_LAST_HEARTBEAT.to_string(), unix_now().to_string());

        let address = match transport.create_queue(&name, attributes).await {
            Ok(address) => address,
            Err(e) => {
                return RpcErrorKind::Provisioning.into_result(
                    Some(&name),
                    &format!("cannot create reply queue: {}", to_rpc_error(e)),
                )
            }
        };

        info!("Created reply queue {} at {}", name, address);

        let tracking = TrackingLog::open(transport.clone(), &config.tracking_queue).await?;
        let heartbeat_interval_seconds = config.heartbeat_interval_seconds;

        let queue = ReplyQueue {
            inner: Arc::new(ReplyQueueInner {
                name: name.clone(),
                address,
                transport,
                config,
                replies: ReplyMap::new(),
                tracking,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                removed: AtomicBool::new(false),
            }),
        };

        // First announcement. The heartbeat task repeats it every interval,
        // so a failure here only delays discovery.
        let announced = queue
            .inner
            .tracking
            .announce(TrackingRecord::alive(
                &name,
                &queue.inner.address,
                heartbeat_interval_seconds,
            ))
            .await;
        if let Err(e) = announced {
            warn!("First tracking announcement for {} failed: {:?}", name, e);
        }

        Ok(queue)
    }

    /// Starts the collector and heartbeat tasks. Idempotent, a second call
    /// is a no-op.
    pub fn start(&self) {
        if self.inner.removed.load(Ordering::SeqCst) {
            warn!("Reply queue {} is removed, not starting", self.inner.name);

            return;
        }

        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Reply queue {} already started", self.inner.name);

            return;
        }

        let collector = tokio::spawn(collect_loop(self.inner.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(self.inner.clone()));

        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([collector, heartbeat]);

        info!("Reply queue {} started", self.inner.name);
    }

    /// Waits up to `wait` for the response with the given correlation id.
    ///
    /// Returns [`ReplyStatus::TimedOut`] when nothing arrives in time and
    /// an error when the queue can no longer deliver anything, or when a
    /// second waiter registers for an id that already has one.
    pub async fn get_response(&self, correlation_id: &str, wait: Duration) -> Result<ReplyStatus> {
        match self.inner.replies.register_waiter(correlation_id) {
            Err(failure) => Err(failure.into()),
            Ok(WaitSlot::Immediate(response)) => Ok(ReplyStatus::Delivered(response)),
            Ok(WaitSlot::Pending(receiver)) => match timeout(wait, receiver).await {
                Ok(Ok(Ok(response))) => Ok(ReplyStatus::Delivered(response)),
                Ok(Ok(Err(failure))) => Err(failure.into()),
                Ok(Err(_closed)) => RpcErrorKind::Internal
                    .into_result(Some(&self.inner.name), "reply slot dropped without a result"),
                Err(_elapsed) => {
                    self.inner.replies.abandon(correlation_id);

                    Ok(ReplyStatus::TimedOut)
                }
            },
        }
    }

    /// Stops the background tasks, deletes the queue and retires its
    /// tracking record. Idempotent, removing an already removed queue is a
    /// no-op and a queue deleted behind our back counts as removed.
    pub async fn remove_queue(&self) -> Result<()> {
        if self.inner.removed.swap(true, Ordering::SeqCst) {
            debug!("Reply queue {} already removed", self.inner.name);

            return Ok(());
        }

        self.inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            logerr!(handle.await);
        }

        // Waiters learn about the removal now instead of timing out later.
        self.inner.replies.fail_all(
            RpcErrorKind::QueueUnhealthy.into_error(Some(&self.inner.name), "reply queue removed"),
        );

        match self.inner.transport.delete_queue(&self.inner.address).await {
            Ok(()) => info!("Removed reply queue {}", self.inner.name),
            Err(e) => {
                let failure = to_rpc_error(e);

                if failure.kind != RpcErrorKind::NotFound {
                    // The queue is still out there, keep it tracked and let
                    // the caller retry.
                    self.inner.removed.store(false, Ordering::SeqCst);

                    return Err(failure.into());
                }

                debug!("Reply queue {} was already gone", self.inner.name);
            }
        }

        logerr!(self.inner.tracking.retire(&self.inner.name).await);

        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &QueueAddress {
        &self.inner.address
    }

    #[cfg(test)]
    pub(crate) fn has_waiter(&self, correlation_id: &str) -> bool {
        self.inner.replies.contains(correlation_id)
    }

    #[cfg(test)]
    pub(crate) fn parked_responses(&self) -> usize {
        self.inner.replies.parked_len()
    }
}

async fn collect_loop(inner: Arc<ReplyQueueInner>) {
    debug!("Collecting responses on {}", inner.name);

    loop {
        let received = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            received = inner
                .transport
                .receive(&inner.address, COLLECT_BATCH, COLLECT_WAIT) => received,
        };

        match received {
            Ok(batch) => {
                for message in batch {
                    collect_one(&inner, message).await;
                }
            }
            Err(e) => {
                if inner.cancel.is_cancelled() {
                    break;
                }

                warn!("Receive on reply queue {} failed: {:?}", inner.name, e);

                tokio::time::sleep(COLLECT_WAIT).await;
            }
        }

        let evicted = inner.replies.evict_stale(
            inner.config.num_messages_before_cleaning,
            inner.config.cleaning_age(),
        );
        if evicted > 0 {
            debug!("Evicted {} unclaimed responses on {}", evicted, inner.name);
        }
    }

    debug!("Response collector on {} stopped", inner.name);
}

async fn collect_one(inner: &ReplyQueueInner, message: ReceivedMessage) {
    let receipt_handle = message.receipt_handle.clone();

    match ResponseMessage::from_received(message) {
        Some(response) => {
            let correlation_id = response.correlation_id.clone();
            let outcome = inner.replies.insert_response(response);

            trace!("Response {} on {}: {:?}", correlation_id, inner.name, outcome);
        }
        None => warn!("Dropping response without correlation id on {}", inner.name),
    }

    // Acknowledged whatever the routing outcome, redelivering a response
    // changes nothing.
    logerr!(
        inner
            .transport
            .delete_message(&inner.address, &receipt_handle)
            .await
    );
}

async fn heartbeat_loop(inner: Arc<ReplyQueueInner>) {
    let interval = inner.config.heartbeat_interval();
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if inner.cancel.is_cancelled() {
            break;
        }

        match beat(&inner).await {
            Ok(()) => {
                if failures > 0 {
                    info!("Heartbeat for {} recovered", inner.name);
                }

                failures = 0;
            }
            Err(e) => {
                failures += 1;

                warn!(
                    "Heartbeat {}/{} for {} failed: {:?}",
                    failures, MAX_HEARTBEAT_FAILURES, inner.name, e
                );

                if failures >= MAX_HEARTBEAT_FAILURES {
                    error!("Reply queue {} is unhealthy, failing its waiters", inner.name);

                    inner.replies.fail_all(RpcErrorKind::QueueUnhealthy.into_error(
                        Some(&inner.name),
                        "heartbeat could not be refreshed",
                    ));
                    inner.cancel.cancel();

                    break;
                }
            }
        }
    }

    debug!("Heartbeat for {} stopped", inner.name);
}

/// One heartbeat: refresh the queue attributes, then re-announce on the
/// tracking log.
async fn beat(inner: &ReplyQueueInner) -> Result<()> {
    let mut attributes = QueueAttributes::new();
    attributes.insert(ATTR_LAST_HEARTBEAT.to_string(), unix_now().to_string());
    attributes.insert(
        ATTR_RETENTION_PERIOD.to_string(),
        inner.config.message_retention_period.to_string(),
    );

    inner
        .transport
        .set_queue_attributes(&inner.address, attributes)
        .await?;

    inner
        .tracking
        .announce(TrackingRecord::alive(
            &inner.name,
            &inner.address,
            inner.config.heartbeat_interval_seconds,
        ))
        .await
}
