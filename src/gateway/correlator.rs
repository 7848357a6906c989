//! Pending-send table keyed by correlation id.
//!
//! Every consumer submission is registered here before it is written, so an
//! acknowledgement racing the write still finds its slot. Entries leave the
//! table exactly once: resolved by an ack, failed by a rejection, a timeout,
//! the loss of their session, or shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::gateway::error::GatewayError;

pub(crate) type ReplySlot = oneshot::Sender<Result<Value, GatewayError>>;

/// Epoch of a send that is registered but not yet written to any session.
pub(crate) const UNSENT_EPOCH: u64 = 0;

struct PendingSend {
    epoch: u64,
    submitted_at: Instant,
    reply: ReplySlot,
}

pub(crate) struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingSend>>,
    ack_timeout: Duration,
    registered: Notify,
    removed: Notify,
}

impl Correlator {
    pub(crate) fn new(ack_timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            ack_timeout,
            registered: Notify::new(),
            removed: Notify::new(),
        }
    }

    /// Allocates the next correlation id. Shared by submissions and probes.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Records a send on session `epoch`, or on [`UNSENT_EPOCH`] while it
    /// waits for a session.
    ///
    /// Returns `false` (and fails `reply`) if `id` is already outstanding.
    pub(crate) fn register(
        &self,
        id: u64,
        epoch: u64,
        submitted_at: Instant,
        reply: ReplySlot,
    ) -> bool {
        {
            let mut pending = self.table();
            if pending.contains_key(&id) {
                drop(pending);
                warn!(event = "gateway_duplicate_send_id", id);
                let _ = reply.send(Err(GatewayError::InvalidPayload));
                return false;
            }
            pending.insert(
                id,
                PendingSend {
                    epoch,
                    submitted_at,
                    reply,
                },
            );
        }
        self.registered.notify_one();
        true
    }

    /// Binds a queued send to the session it is about to be written on.
    ///
    /// Returns `false` if the send already left the table (timed out or shut
    /// down) and must not be written.
    pub(crate) fn assign_epoch(&self, id: u64, epoch: u64) -> bool {
        match self.table().get_mut(&id) {
            Some(entry) => {
                entry.epoch = epoch;
                true
            }
            None => false,
        }
    }

    pub(crate) fn resolve(&self, id: u64, body: Value) -> bool {
        self.complete(id, Ok(body))
    }

    pub(crate) fn fail(&self, id: u64, error: GatewayError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&self, id: u64, outcome: Result<Value, GatewayError>) -> bool {
        let Some(entry) = self.table().remove(&id) else {
            debug!(event = "gateway_reply_for_unknown_id", id);
            return false;
        };
        let _ = entry.reply.send(outcome);
        self.removed.notify_one();
        true
    }

    /// Fails every send whose deadline is at or before `now`.
    pub(crate) fn sweep_expired(&self, now: Instant) -> usize {
        let ack_timeout = self.ack_timeout;
        let expired = self.take_where(|entry| entry.submitted_at + ack_timeout <= now);
        let count = expired.len();
        for (id, entry) in expired {
            warn!(event = "gateway_ack_timeout", id, after_ms = ack_timeout.as_millis() as u64);
            let _ = entry.reply.send(Err(GatewayError::AckTimeout {
                id,
                after: ack_timeout,
            }));
        }
        count
    }

    /// Earliest deadline among outstanding sends.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.table()
            .values()
            .map(|entry| entry.submitted_at + self.ack_timeout)
            .min()
    }

    /// Fails every send written on session `epoch` with `SessionLost`.
    pub(crate) fn fail_epoch(&self, epoch: u64) -> usize {
        let lost = self.take_where(|entry| entry.epoch == epoch);
        let count = lost.len();
        for (id, entry) in lost {
            let _ = entry.reply.send(Err(GatewayError::SessionLost { id }));
        }
        if count > 0 {
            debug!(event = "gateway_sends_lost", epoch, count);
        }
        count
    }

    /// Fails every send still waiting for a session with `Shutdown`.
    pub(crate) fn fail_unsent(&self) -> usize {
        let unsent = self.take_where(|entry| entry.epoch == UNSENT_EPOCH);
        let count = unsent.len();
        for (_, entry) in unsent {
            let _ = entry.reply.send(Err(GatewayError::Shutdown));
        }
        count
    }

    pub(crate) fn fail_all(&self) -> usize {
        let remaining = self.take_where(|_| true);
        let count = remaining.len();
        for (_, entry) in remaining {
            let _ = entry.reply.send(Err(GatewayError::Shutdown));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.table().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completes once no written send is outstanding. Sends still waiting for
    /// a session are not waited on.
    pub(crate) async fn drained(&self) {
        loop {
            let in_flight = self
                .table()
                .values()
                .any(|entry| entry.epoch != UNSENT_EPOCH);
            if !in_flight {
                return;
            }
            self.removed.notified().await;
        }
    }

    fn take_where(&self, predicate: impl Fn(&PendingSend) -> bool) -> Vec<(u64, PendingSend)> {
        let mut pending = self.table();
        let ids: Vec<u64> = pending
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(id, _)| *id)
            .collect();
        let mut taken: Vec<(u64, PendingSend)> = ids
            .into_iter()
            .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
            .collect();
        drop(pending);

        if !taken.is_empty() {
            self.removed.notify_one();
        }
        taken.sort_by_key(|(id, _)| *id);
        taken
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, PendingSend>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Spawns the task that fails sends whose acknowledgement deadline passed.
///
/// It sleeps until the earliest deadline, or `sweep_interval` when nothing is
/// pending, and re-plans whenever a new send is registered.
pub(crate) fn spawn_sweeper(correlator: Arc<Correlator>, sweep_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Instant::now();
            correlator.sweep_expired(now);

            let idle_wake = now + sweep_interval;
            let wake_at = correlator
                .next_deadline()
                .map_or(idle_wake, |deadline| deadline.min(idle_wake));

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = correlator.registered.notified() => {}
            }
        }
    })
}
