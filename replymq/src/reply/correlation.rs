//! Correlation map pairing responses with their waiters.
//!
//! One map per reply queue. The collector task inserts responses, waiters
//! register a oneshot slot under their correlation id, the cleanup sweep
//! evicts what nobody asked for. The map is guarded by a plain mutex and no
//! critical section ever awaits.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::trace;
use tokio::sync::oneshot;

use crate::error::{RpcError, RpcErrorKind};
use crate::message::ResponseMessage;

type ReplySender = oneshot::Sender<Result<ResponseMessage, RpcError>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<Result<ResponseMessage, RpcError>>;

enum Slot {
    /// A waiter arrived first and blocks on the receiver half.
    Waiting(ReplySender),
    /// A response arrived first and is parked until its waiter shows up or
    /// the cleanup sweep evicts it.
    Ready {
        response: ResponseMessage,
        parked_at: Instant,
    },
}

/// What happened to an inserted response.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum InsertOutcome {
    Delivered,
    Parked,
    Discarded,
}

/// What a freshly registered waiter got.
pub(crate) enum WaitSlot {
    /// The response was already parked here.
    Immediate(ResponseMessage),
    /// Nothing yet, await the receiver.
    Pending(ReplyReceiver),
}

#[derive(Default)]
struct MapState {
    slots: HashMap<String, Slot>,
    /// Ids already handed to a waiter, kept around for a while so a
    /// redelivered duplicate is recognized and dropped.
    consumed: HashMap<String, Instant>,
    /// Set once the owning queue went unhealthy, fails every later waiter.
    failed: Option<RpcError>,
}

pub(crate) struct ReplyMap {
    state: Mutex<MapState>,
}

impl ReplyMap {
    pub(crate) fn new() -> ReplyMap {
        ReplyMap {
            state: Mutex::new(MapState::default()),
        }
    }

    /// Routes a collected response. The first response for an id wins,
    /// later ones are duplicates of an at-least-once transport and are
    /// dropped.
    pub(crate) fn insert_response(&self, response: ResponseMessage) -> InsertOutcome {
        let mut state = self.state();

        if state.failed.is_some() {
            return InsertOutcome::Discarded;
        }

        let correlation_id = response.correlation_id.clone();

        if state.consumed.contains_key(&correlation_id) {
            trace!("Duplicate response for already consumed id {correlation_id}");

            return InsertOutcome::Discarded;
        }

        match state.slots.remove(&correlation_id) {
            Some(Slot::Waiting(tx)) => {
                if let Err(undelivered) = tx.send(Ok(response)) {
                    // The waiter timed out moments ago and has not abandoned
                    // its slot yet. Park the response for the cleanup sweep.
                    if let Ok(response) = undelivered {
                        state.slots.insert(
                            correlation_id,
                            Slot::Ready {
                                response,
                                parked_at: Instant::now(),
                            },
                        );
                    }

                    return InsertOutcome::Parked;
                }

                state.consumed.insert(correlation_id, Instant::now());

                InsertOutcome::Delivered
            }
            Some(parked @ Slot::Ready { .. }) => {
                trace!("Duplicate response for parked id {correlation_id}");

                state.slots.insert(correlation_id, parked);

                InsertOutcome::Discarded
            }
            None => {
                state.slots.insert(
                    correlation_id,
                    Slot::Ready {
                        response,
                        parked_at: Instant::now(),
                    },
                );

                InsertOutcome::Parked
            }
        }
    }

    /// Registers a waiter for a correlation id. At most one waiter per id,
    /// a second registration is a caller bug and is rejected.
    pub(crate) fn register_waiter(&self, correlation_id: &str) -> Result<WaitSlot, RpcError> {
        let mut state = self.state();

        if let Some(failure) = &state.failed {
            return Err(failure.clone());
        }

        match state.slots.remove(correlation_id) {
            Some(Slot::Ready { response, .. }) => {
                state
                    .consumed
                    .insert(correlation_id.to_string(), Instant::now());

                Ok(WaitSlot::Immediate(response))
            }
            Some(waiting @ Slot::Waiting(_)) => {
                state.slots.insert(correlation_id.to_string(), waiting);

                Err(RpcErrorKind::Internal.into_error(
                    None,
                    &format!("correlation id {correlation_id} already has a waiter"),
                ))
            }
            None => {
                let (tx, rx) = oneshot::channel();

                state
                    .slots
                    .insert(correlation_id.to_string(), Slot::Waiting(tx));

                Ok(WaitSlot::Pending(rx))
            }
        }
    }

    /// Frees the slot of a waiter that gave up. A response parked under the
    /// id stays, the cleanup sweep owns it from here.
    pub(crate) fn abandon(&self, correlation_id: &str) {
        let mut state = self.state();

        if matches!(state.slots.get(correlation_id), Some(Slot::Waiting(_))) {
            state.slots.remove(correlation_id);
        }
    }

    /// Evicts parked responses older than `max_age` and, when more than
    /// `max_parked` are left, the oldest ones beyond that cap. Waiting
    /// slots are never touched. Returns the number of evictions.
    pub(crate) fn evict_stale(&self, max_parked: usize, max_age: Duration) -> usize {
        let mut state = self.state();
        let now = Instant::now();

        state
            .consumed
            .retain(|_, consumed_at| now.duration_since(*consumed_at) < max_age);

        let mut evicted = 0;

        state.slots.retain(|correlation_id, slot| match slot {
            Slot::Waiting(_) => true,
            Slot::Ready { parked_at, .. } => {
                if now.duration_since(*parked_at) < max_age {
                    true
                } else {
                    trace!("Evicting response {correlation_id}, parked too long");
                    evicted += 1;

                    false
                }
            }
        });

        let mut parked: Vec<(String, Instant)> = state
            .slots
            .iter()
            .filter_map(|(correlation_id, slot)| match slot {
                Slot::Ready { parked_at, .. } => Some((correlation_id.clone(), *parked_at)),
                Slot::Waiting(_) => None,
            })
            .collect();

        if parked.len() > max_parked {
            parked.sort_by_key(|(_, parked_at)| *parked_at);

            let excess = parked.len() - max_parked;
            for (correlation_id, _) in parked.drain(..excess) {
                trace!("Evicting response {correlation_id}, map over capacity");
                state.slots.remove(&correlation_id);
                evicted += 1;
            }
        }

        evicted
    }

    /// Fails every current waiter with `error` and latches the map so later
    /// registrations fail the same way.
    pub(crate) fn fail_all(&self, error: RpcError) {
        let mut state = self.state();

        for (_, slot) in state.slots.drain() {
            if let Slot::Waiting(tx) = slot {
                let _ = tx.send(Err(error.clone()));
            }
        }

        state.consumed.clear();
        state.failed = Some(error);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, correlation_id: &str) -> bool {
        self.state().slots.contains_key(correlation_id)
    }

    #[cfg(test)]
    pub(crate) fn parked_len(&self) -> usize {
        self.state()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Ready { .. }))
            .count()
    }

    fn state(&self) -> MutexGuard<'_, MapState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
