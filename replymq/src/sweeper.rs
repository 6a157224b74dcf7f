//! Cleanup of reply queues that lost their producer.
//!
//! Every reply queue announces itself on a shared tracking queue and keeps
//! re-announcing with each heartbeat. The [`Sweeper`] periodically drains
//! those announcements, folds them to the newest record per queue and
//! deletes the queues whose heartbeats stopped long enough ago. Surviving
//! records are re-announced before the drained ones are acknowledged, so a
//! crash mid-sweep never loses track of a queue.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use log::{debug, info, trace, warn};
use serde_derive::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SweeperConfig;
use crate::error::{to_rpc_error, RpcError, RpcErrorKind};
use crate::logerr;
use crate::message::Attributes;
use crate::transport::{QueueAddress, QueueAttributes, SharedTransport};

const DRAIN_BATCH: usize = 10;
/// Upper bound on records handled in one sweep pass, the rest waits for the
/// next pass.
const MAX_SCAN_RECORDS: usize = 1000;

/// Seconds since the unix epoch.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|since| since.as_secs())
        .unwrap_or(0)
}

/// One announcement on the tracking queue.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TrackingRecord {
    pub queue_name: String,
    pub queue_address: String,
    /// Unix timestamp of the producer's last heartbeat.
    pub last_heartbeat: u64,
    /// Heartbeat interval the producer promised, in seconds.
    pub heartbeat_interval: u64,
    /// True once the producer removed the queue itself, a tombstone.
    #[serde(default)]
    pub retired: bool,
}

impl TrackingRecord {
    pub fn alive(queue_name: &str, queue_address: &QueueAddress, heartbeat_interval: u64) -> TrackingRecord {
        TrackingRecord {
            queue_name: queue_name.to_string(),
            queue_address: queue_address.as_str().to_string(),
            last_heartbeat: unix_now(),
            heartbeat_interval,
            retired: false,
        }
    }

    pub fn tombstone(queue_name: &str) -> TrackingRecord {
        TrackingRecord {
            queue_name: queue_name.to_string(),
            queue_address: String::new(),
            last_heartbeat: unix_now(),
            heartbeat_interval: 0,
            retired: true,
        }
    }
}

/// Append-only log of reply queues, kept as JSON records on its own queue
/// so any process can discover queues whose producer died.
#[derive(Clone)]
pub struct TrackingLog {
    transport: SharedTransport,
    queue: QueueAddress,
}

impl TrackingLog {
    /// Resolves the tracking queue, creating it when it does not exist yet.
    pub async fn open(transport: SharedTransport, name: &str) -> Result<TrackingLog> {
        let queue = match transport.get_queue(name).await? {
            Some(address) => address,
            None => match transport.create_queue(name, QueueAttributes::new()).await {
                Ok(address) => address,
                // Lost a create race against another process, look again.
                Err(e) => match transport.get_queue(name).await? {
                    Some(address) => address,
                    None => return Err(e),
                },
            },
        };

        debug!("Tracking log on {}", queue);

        Ok(TrackingLog { transport, queue })
    }

    pub fn queue(&self) -> &QueueAddress {
        &self.queue
    }

    pub async fn announce(&self, record: TrackingRecord) -> Result<()> {
        trace!("Announcing {:?}", record);

        let body = serde_json::to_string(&record)?;

        self.transport.send(&self.queue, body, Attributes::new()).await
    }

    /// Appends a tombstone for a queue the producer already removed.
    pub async fn retire(&self, queue_name: &str) -> Result<()> {
        self.announce(TrackingRecord::tombstone(queue_name)).await
    }

    /// Receives every currently visible record without acknowledging any.
    /// Records that do not parse are dropped from the log right away.
    pub(crate) async fn drain(&self) -> Result<Vec<(TrackingRecord, String)>> {
        let mut records = Vec::new();

        loop {
            let batch = self
                .transport
                .receive(&self.queue, DRAIN_BATCH, Duration::ZERO)
                .await?;

            if batch.is_empty() {
                break;
            }

            for message in batch {
                match serde_json::from_str::<TrackingRecord>(&message.body) {
                    Ok(record) => records.push((record, message.receipt_handle)),
                    Err(e) => {
                        warn!("Dropping undecodable tracking record: {:?}", e);

                        logerr!(
                            self.transport
                                .delete_message(&self.queue, &message.receipt_handle)
                                .await
                        );
                    }
                }
            }

            if records.len() >= MAX_SCAN_RECORDS {
                break;
            }
        }

        Ok(records)
    }

    pub(crate) async fn acknowledge(&self, receipt_handle: &str) -> Result<()> {
        self.transport.delete_message(&self.queue, receipt_handle).await
    }

    /// Deletes the tracking queue itself. Explicit teardown only, nothing
    /// calls this as a side effect.
    pub async fn remove(&self) -> Result<()> {
        self.transport.delete_queue(&self.queue).await
    }
}

/// What one sweep pass did.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Names of orphaned queues deleted by this pass.
    pub removed: Vec<String>,
    /// Queues whose heartbeat is recent enough to live on.
    pub live: usize,
    /// Tombstoned queues whose records were dropped.
    pub retired: usize,
}

/// Deletes reply queues whose producer stopped heartbeating.
pub struct Sweeper {
    transport: SharedTransport,
    log: TrackingLog,
    config: SweeperConfig,
}

impl Sweeper {
    pub async fn open(transport: SharedTransport, config: SweeperConfig) -> Result<Sweeper> {
        let log = TrackingLog::open(transport.clone(), &config.tracking_queue).await?;

        Ok(Sweeper {
            transport,
            log,
            config,
        })
    }

    /// Spawns the periodic scan loop.
    pub fn start(self) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            info!("Sweeper started on {}", self.log.queue());

            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.sweep_interval()) => {
                        match self.scan().await {
                            Ok(report) if report.removed.is_empty() => {
                                trace!("Sweep pass kept {} live queues", report.live)
                            }
                            Ok(report) => info!("Sweep removed {:?}", report.removed),
                            Err(e) => warn!("Sweep pass failed: {:?}", e),
                        }
                    }
                }
            }

            debug!("Sweeper stopped");
        });

        SweeperHandle { cancel, join }
    }

    /// One sweep pass over the tracking log. Public so operators and tests
    /// can drive sweeps directly, a pass over an already clean log is a
    /// no-op.
    pub async fn scan(&self) -> Result<SweepReport> {
        let drained = self.log.drain().await?;

        // Newest record per queue wins, a tombstone outranks heartbeats.
        let mut newest: HashMap<String, TrackingRecord> = HashMap::new();
        let mut receipts: HashMap<String, Vec<String>> = HashMap::new();

        for (record, receipt) in drained {
            receipts
                .entry(record.queue_name.clone())
                .or_default()
                .push(receipt);

            match newest.get(&record.queue_name) {
                Some(current) if !supersedes(&record, current) => {}
                _ => {
                    newest.insert(record.queue_name.clone(), record);
                }
            }
        }

        let now = unix_now();
        let mut report = SweepReport::default();

        for (queue_name, record) in newest {
            if record.retired {
                trace!("Queue {} was retired by its producer", queue_name);

                report.retired += 1;
            } else if is_orphaned(&self.config, &record, now) {
                match self.delete_orphan(&record).await {
                    Ok(()) => {
                        info!("Removed orphaned reply queue {}", queue_name);

                        report.removed.push(queue_name.clone());
                    }
                    Err(e) => {
                        warn!("Cannot remove orphaned queue {}: {:?}", queue_name, e);

                        // Keep the queue on the books for the next pass.
                        self.log.announce(record.clone()).await?;
                    }
                }
            } else {
                // Compaction: one fresh record replaces everything drained
                // for this queue. Announced before the acknowledgments below
                // so a crash in between leaves the queue tracked.
                self.log.announce(record.clone()).await?;

                report.live += 1;
            }

            for receipt in receipts.remove(&queue_name).unwrap_or_default() {
                logerr!(self.log.acknowledge(&receipt).await);
            }
        }

        debug!(
            "Sweep pass: {} live, {} retired, {} removed",
            report.live,
            report.retired,
            report.removed.len()
        );

        Ok(report)
    }

    /// Explicit teardown of the tracking queue itself.
    pub async fn remove_tracking_queue(&self) -> Result<()> {
        self.log.remove().await
    }

    async fn delete_orphan(&self, record: &TrackingRecord) -> Result<()> {
        let queue = QueueAddress::new(record.queue_address.clone());

        match self.transport.delete_queue(&queue).await {
            Ok(()) => Ok(()),
            Err(e) => match to_rpc_error(e) {
                // Someone else already deleted it, same outcome.
                RpcError {
                    kind: RpcErrorKind::NotFound,
                    ..
                } => Ok(()),
                other => Err(other.into()),
            },
        }
    }
}

/// Running sweeper, [`stop`](SweeperHandle::stop) shuts it down.
pub struct SweeperHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub async fn stop(self) {
        self.cancel.cancel();

        logerr!(self.join.await);
    }
}

/// Whether `candidate` carries newer truth than `current` for the same
/// queue.
fn supersedes(candidate: &TrackingRecord, current: &TrackingRecord) -> bool {
    if candidate.retired != current.retired {
        return candidate.retired;
    }

    candidate.last_heartbeat > current.last_heartbeat
}

/// A queue is orphaned once its last heartbeat is older than the grace
/// period. Queues announcing a long heartbeat interval get two intervals of
/// grace instead, so a slow but honest producer is not swept.
fn is_orphaned(config: &SweeperConfig, record: &TrackingRecord, now: u64) -> bool {
    let grace = config.grace_period_seconds.max(2 * record.heartbeat_interval);

    now.saturating_sub(record.last_heartbeat) > grace
}
