//! Transmit queue: pending and in-flight requests for one connection.
//!
//! The queue moves through three states over a connection's life. While the
//! backend is unresolved it is *halted*: enqueues accumulate (and still
//! throttle producers) but nothing is transmitted. Once a backend is known
//! it *transmits*, keeping at most a window of entries in flight. After a
//! reconnect has drained it, it *forwards* every further enqueue to the
//! successor connection.

use std::{collections::VecDeque, sync::Weak};

use log::{debug, warn};

use crate::{
    backend::{BackendInfo, Cookie},
    connection::{Connection, MAX_DELAY_NANOS},
    entry::{ConnectionEntry, TransmittedEntry},
    error::PoisonedError,
    message::{RequestEnvelope, ResponseEnvelope},
};

/// Compute the producer throttle delay for a queue of `depth` entries
/// against a `window`.
///
/// The exact shape: zero up to half the window, then a linear ramp that
/// reaches [`MAX_DELAY_NANOS`] when the depth hits the window, saturated
/// beyond it:
///
/// ```text
/// delay(d) = 0                                   for d <= W/2
///          = MAX_DELAY * (d - W/2) / (W - W/2)   for W/2 < d < W
///          = MAX_DELAY                           for d >= W
/// ```
fn throttle_delay(depth: usize, window: usize) -> u64 {
    let window = window.max(1);
    let low_watermark = window / 2;
    if depth <= low_watermark {
        return 0;
    }
    if depth >= window {
        return MAX_DELAY_NANOS;
    }
    let over = (depth - low_watermark) as u128;
    let span = (window - low_watermark) as u128;
    (u128::from(MAX_DELAY_NANOS) * over / span) as u64
}

/// Weak handle through which a drained queue forwards further enqueues to
/// its successor connection.
///
/// Holding the successor weakly keeps ownership a tree: the client actor
/// owns the successor; a retired predecessor must not.
#[derive(Debug)]
pub(crate) struct ReconnectForwarder {
    cookie: Cookie,
    successor: Weak<Connection>,
}

impl ReconnectForwarder {
    pub(crate) fn new(cookie: Cookie, successor: Weak<Connection>) -> Self {
        Self { cookie, successor }
    }

    fn forward(&self, entry: ConnectionEntry, now: u64) -> Result<u64, PoisonedError> {
        match self.successor.upgrade() {
            Some(successor) => successor.enqueue_entry(entry, now),
            None => {
                warn!(
                    "connection {} has no live successor, refusing entry",
                    self.cookie
                );
                Err(PoisonedError::new(
                    self.cookie,
                    crate::error::RequestError::Stopped,
                ))
            }
        }
    }
}

/// Transmit-side state of the queue.
#[derive(Debug)]
enum QueueState {
    /// Backend unknown: hold entries, throttle against the target depth.
    Halted { target_depth: usize },
    /// Backend resolved: transmit within the backpressure window.
    Transmitting(TxChannel),
    /// Drained by a reconnect: hand everything to the successor.
    Forwarding(ReconnectForwarder),
}

/// Live transmit channel to a resolved backend.
#[derive(Debug)]
struct TxChannel {
    backend: BackendInfo,
    session_id: u64,
    next_sequence: u64,
    /// Backpressure window: `min(target depth, backend max_messages)`.
    window: usize,
}

/// Ordered pending and in-flight entries for one connection.
///
/// All mutation happens under the owning connection's lock. Entries leave
/// exactly once: by completion, by the timeout sweep, by poisoning, or by
/// being drained into a successor.
#[derive(Debug)]
pub(crate) struct TransmitQueue {
    pending: VecDeque<ConnectionEntry>,
    inflight: VecDeque<TransmittedEntry>,
    /// Tick at which the queue last made forward progress. Meaningless
    /// while the queue is empty; see [`ticks_stalling`](Self::ticks_stalling).
    stall_ticks: u64,
    state: QueueState,
}

impl TransmitQueue {
    /// Create a halted queue.
    ///
    /// `stall_origin` seeds the no-progress accounting. A fresh connection
    /// passes "now"; a reconnect successor passes the predecessor's stall
    /// origin so the terminal no-progress window stays cumulative across
    /// reconnect cycles (the origin may overstate the stall by the length
    /// of one replay).
    pub(crate) fn halted(target_depth: usize, stall_origin: u64) -> Self {
        Self {
            pending: VecDeque::new(),
            inflight: VecDeque::new(),
            stall_ticks: stall_origin,
            state: QueueState::Halted { target_depth },
        }
    }

    pub(crate) fn is_empty(&self) -> bool { self.pending.is_empty() && self.inflight.is_empty() }

    pub(crate) fn has_successor(&self) -> bool {
        matches!(self.state, QueueState::Forwarding(_))
    }

    /// Tick at which the queue last made progress, for seeding a successor.
    pub(crate) fn stall_origin(&self) -> u64 { self.stall_ticks }

    /// Ticks since the queue last made forward progress; zero while empty.
    pub(crate) fn ticks_stalling(&self, now: u64) -> u64 {
        if self.is_empty() {
            0
        } else {
            now.saturating_sub(self.stall_ticks)
        }
    }

    /// Append an entry, transmit whatever the window allows, and return the
    /// throttle delay the producer should observe.
    ///
    /// On a forwarding queue the entry goes straight to the successor and
    /// the successor's delay is returned.
    pub(crate) fn enqueue(&mut self, entry: ConnectionEntry, now: u64) -> Result<u64, PoisonedError> {
        let window = match &self.state {
            QueueState::Forwarding(forwarder) => return forwarder.forward(entry, now),
            QueueState::Halted { target_depth } => *target_depth,
            QueueState::Transmitting(tx) => tx.window,
        };

        if self.is_empty() {
            // The stall clock starts when work appears.
            self.stall_ticks = now;
        }
        self.pending.push_back(entry);
        self.try_transmit(now);

        let depth = self.pending.len() + self.inflight.len();
        Ok(throttle_delay(depth, window))
    }

    /// Seed a halted successor queue with entries drained from a
    /// predecessor, preserving their original enqueue order and ticks.
    pub(crate) fn seed(&mut self, entries: Vec<ConnectionEntry>) {
        debug_assert!(self.is_empty(), "replay must seed an empty queue");
        debug_assert!(
            matches!(self.state, QueueState::Halted { .. }),
            "replay must seed a halted queue"
        );
        self.pending.extend(entries);
    }

    /// Switch a halted queue to transmitting under `session_id` and push
    /// out as much backlog as the window allows.
    pub(crate) fn set_transmitting(&mut self, backend: BackendInfo, session_id: u64, now: u64) {
        let target_depth = match &self.state {
            QueueState::Halted { target_depth } => *target_depth,
            _ => {
                warn!("refusing to start transmitting on a {:?} queue", self.state);
                return;
            }
        };
        let window = target_depth.min(backend.max_messages()).max(1);
        self.state = QueueState::Transmitting(TxChannel {
            backend,
            session_id,
            next_sequence: 0,
            window,
        });
        self.try_transmit(now);
    }

    /// Install the forwarder that hands further enqueues to the successor.
    ///
    /// The caller drains the queue first and keeps the connection locked
    /// across drain and install, so nothing can be pending here.
    pub(crate) fn set_forwarder(&mut self, forwarder: ReconnectForwarder) {
        debug_assert!(self.is_empty(), "forwarder installed on a non-empty queue");
        self.state = QueueState::Forwarding(forwarder);
    }

    /// Fill the in-flight window from pending entries.
    pub(crate) fn try_transmit(&mut self, now: u64) {
        let QueueState::Transmitting(tx) = &mut self.state else {
            return;
        };
        while self.inflight.len() < tx.window {
            let Some(entry) = self.pending.pop_front() else {
                break;
            };
            let sequence = tx.next_sequence;
            tx.next_sequence += 1;
            let envelope = RequestEnvelope::new(
                tx.session_id,
                sequence,
                tx.backend.version().bounded(),
                entry.request().clone(),
            );
            if !tx.backend.endpoint().send(envelope) {
                // Endpoint gone. Keep the entry in flight; the aliveness
                // tier will notice the silence and reconnect.
                debug!(
                    "backend endpoint closed, keeping sequence {} queued for replay",
                    sequence
                );
            }
            self.inflight
                .push_back(TransmittedEntry::new(entry, tx.session_id, sequence, now));
        }
    }

    /// Match an inbound envelope against the in-flight entries.
    ///
    /// In-order replies match the head in O(1); reordered replies fall back
    /// to a scan. An unknown `(session, sequence)` leaves the queue
    /// untouched and returns `None`. On a match the window is refilled
    /// before returning the entry for out-of-lock completion.
    pub(crate) fn complete(
        &mut self,
        envelope: &ResponseEnvelope,
        now: u64,
    ) -> Option<TransmittedEntry> {
        let matches = |entry: &TransmittedEntry| {
            entry.session_id() == envelope.session_id()
                && entry.tx_sequence() == envelope.tx_sequence()
        };
        let matched = if self.inflight.front().is_some_and(&matches) {
            self.inflight.pop_front()
        } else {
            let index = self.inflight.iter().position(matches)?;
            self.inflight.remove(index)
        }?;

        self.stall_ticks = now;
        self.try_transmit(now);
        Some(matched)
    }

    /// Oldest entry still queued, in flight before pending.
    ///
    /// In-flight entries were transmitted in enqueue order, so the head of
    /// the in-flight deque is always the oldest entry overall.
    pub(crate) fn peek_oldest(&self) -> Option<&ConnectionEntry> {
        self.inflight
            .front()
            .map(TransmittedEntry::entry)
            .or_else(|| self.pending.front())
    }

    /// Remove the oldest entry; the timeout sweep completes it.
    ///
    /// Removal counts as forward motion of the queue head.
    pub(crate) fn remove_oldest(&mut self, now: u64) -> Option<ConnectionEntry> {
        let removed = match self.inflight.pop_front() {
            Some(transmitted) => Some(transmitted.into_entry()),
            None => self.pending.pop_front(),
        };
        if removed.is_some() {
            self.stall_ticks = now;
        }
        removed
    }

    /// Remove every entry in original enqueue order, for replay into a
    /// successor.
    pub(crate) fn drain(&mut self) -> Vec<ConnectionEntry> {
        let mut entries = Vec::with_capacity(self.inflight.len() + self.pending.len());
        entries.extend(self.inflight.drain(..).map(TransmittedEntry::into_entry));
        entries.extend(self.pending.drain(..));
        entries
    }

    /// Remove every entry so the caller can fail them with the poison
    /// cause outside the connection lock.
    pub(crate) fn poison(&mut self) -> Vec<ConnectionEntry> { self.drain() }
}
