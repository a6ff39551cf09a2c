//! Per-backend connection: queueing, dispatch, timers and reconnect.
//!
//! A connection moves through three states. *Connecting* holds a halted
//! queue while the backend is resolved; *Connected* transmits within the
//! resolved backpressure window; *Reconnecting* has drained its queue into
//! a successor and forwards any further enqueues there. Poisoning is
//! terminal from any state.
//!
//! Producers touch a connection from arbitrary tasks; the client actor
//! delivers responses and timer ticks. One mutex serialises all of it, and
//! completion callbacks are never invoked while that mutex is held.

mod timer;

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, OnceLock},
    time::Duration,
};

use log::{debug, info};
use tokio::time::sleep;

pub use timer::{
    BACKEND_ALIVE_TIMEOUT_NANOS,
    DEBUG_DELAY_NANOS,
    MAX_DELAY_NANOS,
    NO_PROGRESS_TIMEOUT_NANOS,
    REQUEST_TIMEOUT_NANOS,
};
pub(crate) use timer::TimerVerdict;

use crate::{
    actor::ClientActorContext,
    backend::{BackendInfo, Cookie},
    entry::{ConnectionEntry, ResponseCallback},
    error::{PoisonedError, RequestError},
    message::{RequestMessage, ResponseEnvelope},
    queue::{ReconnectForwarder, TransmitQueue},
};


/// Variant-specific connection state.
#[derive(Debug)]
pub(crate) enum ConnectionState {
    /// Backend resolution in flight; `attempts` counts restarts.
    Connecting { attempts: u32 },
    /// Backend resolved; the queue transmits against it.
    Connected { backend: BackendInfo },
    /// Drained into a successor; the queue forwards.
    Reconnecting,
}

/// Lock-protected mutable state of a connection.
pub(crate) struct ConnectionInner {
    pub(crate) queue: TransmitQueue,
    pub(crate) state: ConnectionState,
    /// Tick of the last observed backend activity.
    pub(crate) last_received_ticks: u64,
    /// Whether a scheduled timer tick is outstanding.
    pub(crate) have_timer: bool,
}

/// Logical connection to one backend shard.
///
/// Owned by the client actor and shared with producers through `Arc`; a
/// handle stays usable across reconnects because a drained connection
/// forwards to its successor.
pub struct Connection {
    context: Arc<ClientActorContext>,
    cookie: Cookie,
    /// Poison cause, set at most once. Readable without the lock so
    /// producers can bail out before contending.
    poisoned: OnceLock<RequestError>,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    /// Create a connection awaiting backend resolution.
    pub(crate) fn connecting(context: Arc<ClientActorContext>, cookie: Cookie) -> Arc<Self> {
        let now = context.ticks_now();
        let target_queue_depth = context.target_queue_depth();
        Arc::new(Self {
            context,
            cookie,
            poisoned: OnceLock::new(),
            inner: Mutex::new(ConnectionInner {
                queue: TransmitQueue::halted(target_queue_depth, now),
                state: ConnectionState::Connecting { attempts: 0 },
                last_received_ticks: now,
                have_timer: false,
            }),
        })
    }

    /// Backend this connection serves.
    #[must_use]
    pub fn cookie(&self) -> Cookie { self.cookie }

    /// Current tick reading.
    #[must_use]
    pub fn current_ticks(&self) -> u64 { self.context.ticks_now() }

    /// Snapshot of the resolved backend, if connected.
    #[must_use]
    pub fn backend_info(&self) -> Option<BackendInfo> {
        match &self.lock_inner().state {
            ConnectionState::Connected { backend } => Some(backend.clone()),
            ConnectionState::Connecting { .. } | ConnectionState::Reconnecting => None,
        }
    }

    /// Poison cause, if the connection has been poisoned.
    #[must_use]
    pub fn poisoned(&self) -> Option<&RequestError> { self.poisoned.get() }

    /// Enqueue a request and observe the backpressure the queue asks for.
    ///
    /// The returned future sleeps for the throttle delay after the entry is
    /// queued; the completion callback may run before that sleep finishes.
    /// Dropping the future mid-sleep leaves the entry queued and untouched.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonedError`] once the connection is poisoned; the
    /// callback is not invoked in that case.
    pub async fn send_request(
        self: &Arc<Self>,
        request: RequestMessage,
        callback: ResponseCallback,
    ) -> Result<(), PoisonedError> {
        let now = self.current_ticks();
        let entry = ConnectionEntry::new(request, callback, now);
        let mut delay = self.enqueue_entry(entry, now)?;
        if delay > MAX_DELAY_NANOS {
            info!(
                "{}: capping throttle delay from {:.3}s to {:.3}s on {:?}",
                self.context.tag(),
                delay as f64 * 1e-9,
                MAX_DELAY_NANOS as f64 * 1e-9,
                self
            );
            delay = MAX_DELAY_NANOS;
        }
        if delay >= DEBUG_DELAY_NANOS {
            debug!(
                "{}: sleeping for {}ms on {:?}",
                self.context.tag(),
                delay / 1_000_000,
                self
            );
        }
        if delay > 0 {
            sleep(Duration::from_nanos(delay)).await;
        }
        Ok(())
    }

    /// Enqueue a request without observing backpressure.
    ///
    /// Unlike [`send_request`](Self::send_request) this never suspends, so
    /// it must not be used from paths that originate producer pressure.
    /// `enqueued_ticks` stamps the entry, letting internal callers replay
    /// requests with their original enqueue time.
    ///
    /// # Errors
    ///
    /// Returns [`PoisonedError`] once the connection is poisoned.
    pub fn enqueue_request(
        self: &Arc<Self>,
        request: RequestMessage,
        callback: ResponseCallback,
        enqueued_ticks: u64,
    ) -> Result<(), PoisonedError> {
        let entry = ConnectionEntry::new(request, callback, enqueued_ticks);
        self.enqueue_entry(entry, self.current_ticks()).map(|_| ())
    }

    /// Enqueue an entry, arming the request-timeout timer if the queue was
    /// empty, and return the throttle delay in ticks.
    pub(crate) fn enqueue_entry(
        self: &Arc<Self>,
        entry: ConnectionEntry,
        now: u64,
    ) -> Result<u64, PoisonedError> {
        if let Some(cause) = self.poisoned.get() {
            return Err(PoisonedError::new(self.cookie, cause.clone()));
        }
        let mut inner = self.lock_inner();
        // Poisoning happens under the lock; re-check now that we hold it.
        if let Some(cause) = self.poisoned.get() {
            return Err(PoisonedError::new(self.cookie, cause.clone()));
        }
        if inner.queue.is_empty() {
            // The queue is becoming non-empty; make sure a timer watches it.
            let delay = (entry.enqueued_ticks() + REQUEST_TIMEOUT_NANOS).saturating_sub(now);
            self.schedule_timer(&mut inner, delay);
        }
        inner.queue.enqueue(entry, now)
    }

    /// Deliver an inbound response envelope.
    ///
    /// Any envelope counts as backend activity. A matched entry completes
    /// outside the lock; an unmatched `(session, sequence)` is logged and
    /// dropped without touching the queue.
    pub fn receive_response(&self, envelope: &ResponseEnvelope) {
        let now = self.current_ticks();
        let matched = {
            let mut inner = self.lock_inner();
            inner.last_received_ticks = now;
            inner.queue.complete(envelope, now)
        };
        match matched {
            Some(entry) => {
                debug!(
                    "{}: completing {:?} with session {} sequence {}",
                    self.context.tag(),
                    entry,
                    envelope.session_id(),
                    envelope.tx_sequence()
                );
                entry.complete(envelope.to_response());
            }
            None => debug!(
                "{}: no entry matching session {} sequence {} on {:?}, dropping envelope",
                self.context.tag(),
                envelope.session_id(),
                envelope.tx_sequence(),
                self
            ),
        }
    }

    /// Terminally fail the connection and every queued entry.
    pub fn poison(&self, cause: RequestError) {
        let entries = {
            let mut inner = self.lock_inner();
            self.locked_poison(&mut inner, &cause)
        };
        for entry in entries {
            entry.complete(Err(cause.clone()));
        }
    }

    /// Flip a resolved connection to Connected and dispatch its backlog.
    ///
    /// Returns `false` when the resolution is stale: the connection is
    /// already connected, reconnecting or poisoned.
    pub(crate) fn complete_connect(&self, backend: BackendInfo, session_id: u64) -> bool {
        let now = self.current_ticks();
        let mut inner = self.lock_inner();
        if self.poisoned.get().is_some() {
            debug!(
                "{}: dropping resolution for poisoned {:?}",
                self.context.tag(),
                self
            );
            return false;
        }
        match inner.state {
            ConnectionState::Connecting { .. } => {}
            ConnectionState::Connected { .. } | ConnectionState::Reconnecting => {
                debug!(
                    "{}: dropping stale resolution for {:?}",
                    self.context.tag(),
                    self
                );
                return false;
            }
        }
        inner.queue.set_transmitting(backend.clone(), session_id, now);
        inner.state = ConnectionState::Connected { backend };
        // Dispatching the backlog may have taken a while on deep queues;
        // the aliveness window starts fresh from here.
        inner.last_received_ticks = now;
        info!(
            "{}: backend {} connected, session {}",
            self.context.tag(),
            self.cookie,
            session_id
        );
        true
    }

    /// Drain this connection into `successor` and start forwarding.
    ///
    /// The successor's halted queue receives every uncompleted entry in
    /// original enqueue order and inherits this queue's stall origin, so
    /// the no-progress window accumulates across reconnect cycles.
    pub(crate) fn begin_reconnect(self: &Arc<Self>, successor: &Arc<Connection>) {
        let now = self.current_ticks();
        let mut inner = self.lock_inner();
        let stall_origin = inner.queue.stall_origin();
        let entries = inner.queue.drain();
        debug!(
            "{}: replaying {} entries from {:?} into successor",
            self.context.tag(),
            entries.len(),
            self
        );
        successor.seed_replay(entries, stall_origin, now);
        inner
            .queue
            .set_forwarder(ReconnectForwarder::new(self.cookie, Arc::downgrade(successor)));
        inner.state = ConnectionState::Reconnecting;
    }

    /// Accept replayed entries from a predecessor.
    ///
    /// Resets the aliveness origin to "now": replay may have taken a
    /// while, and the successor should get a full window to hear from the
    /// new backend. The stall origin deliberately stays the predecessor's.
    fn seed_replay(self: &Arc<Self>, entries: Vec<ConnectionEntry>, stall_origin: u64, now: u64) {
        let mut inner = self.lock_inner();
        inner.queue = TransmitQueue::halted(self.context.target_queue_depth(), stall_origin);
        inner.queue.seed(entries);
        inner.last_received_ticks = now;
        let head_delay = inner
            .queue
            .peek_oldest()
            .map(|head| (head.enqueued_ticks() + REQUEST_TIMEOUT_NANOS).saturating_sub(now));
        if let Some(delay) = head_delay {
            self.schedule_timer(&mut inner, delay);
        }
    }

    /// Restart backend resolution on a still-connecting connection after a
    /// timer tier fired. Returns the new attempt count for backoff.
    pub(crate) fn restart_connecting(self: &Arc<Self>, now: u64) -> u32 {
        let mut inner = self.lock_inner();
        let attempt = match &mut inner.state {
            ConnectionState::Connecting { attempts } => {
                *attempts += 1;
                *attempts
            }
            ConnectionState::Connected { .. } | ConnectionState::Reconnecting => return 0,
        };
        // The aliveness tier now measures the new resolution attempt.
        inner.last_received_ticks = now;
        if !inner.queue.is_empty() {
            self.schedule_timer(&mut inner, BACKEND_ALIVE_TIMEOUT_NANOS);
        }
        attempt
    }

    /// Current resolution attempt count, if still connecting.
    pub(crate) fn connecting_attempts(&self) -> Option<u32> {
        match self.lock_inner().state {
            ConnectionState::Connecting { attempts } => Some(attempts),
            ConnectionState::Connected { .. } | ConnectionState::Reconnecting => None,
        }
    }

    /// Record a failed resolution attempt and return the new count.
    pub(crate) fn note_resolve_failure(&self) -> u32 {
        match &mut self.lock_inner().state {
            ConnectionState::Connecting { attempts } => {
                *attempts += 1;
                *attempts
            }
            ConnectionState::Connected { .. } | ConnectionState::Reconnecting => 0,
        }
    }

    /// Shared context of the owning client actor.
    #[must_use]
    pub fn context(&self) -> &Arc<ClientActorContext> { &self.context }

    /// Ticks since the backend was last heard from.
    pub(crate) fn backend_silent_ticks(&self, now: u64) -> u64 {
        now.saturating_sub(self.lock_inner().last_received_ticks)
    }

    fn locked_poison(&self, inner: &mut ConnectionInner, cause: &RequestError) -> Vec<ConnectionEntry> {
        // First cause wins; a second poison finds the queue already empty.
        let _ = self.poisoned.set(cause.clone());
        inner.queue.poison()
    }

    fn lock_inner(&self) -> MutexGuard<'_, ConnectionInner> {
        self.inner.lock().expect("connection lock poisoned")
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client", &self.context.tag())
            .field("cookie", &self.cookie)
            .field("poisoned", &self.poisoned.get())
            .finish()
    }
}
