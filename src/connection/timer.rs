//! Tiered timer regime for a connection.
//!
//! Three tiers, spaced roughly 4x apart so each has room to recover
//! through the next, all kept in nanosecond ticks to avoid conversions on
//! the fast path:
//!
//! 1. backend aliveness: silence past this window forces a reconnect;
//! 2. request timeout: an entry unanswered this long fails individually;
//! 3. no progress: a queue stalled this long poisons the connection.

use std::{sync::Arc, time::Duration};

use log::{debug, error};

use super::{Connection, ConnectionInner};
use crate::{entry::ConnectionEntry, error::RequestError};

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Maximum permitted silence from a backend while requests are
/// outstanding. Exceeding it tears the connection down for reconnect.
pub const BACKEND_ALIVE_TIMEOUT_NANOS: u64 = 30 * NANOS_PER_SECOND;

/// Maximum time a request may sit from enqueue to completion.
pub const REQUEST_TIMEOUT_NANOS: u64 = 2 * 60 * NANOS_PER_SECOND;

/// Maximum time the queue may go without any forward progress before the
/// connection terminates itself.
pub const NO_PROGRESS_TIMEOUT_NANOS: u64 = 15 * 60 * NANOS_PER_SECOND;

/// Upper bound on the throttle delay a producer is asked to observe.
pub const MAX_DELAY_NANOS: u64 = 5 * NANOS_PER_SECOND;

/// Throttle delays at or above this are logged.
pub const DEBUG_DELAY_NANOS: u64 = NANOS_PER_SECOND / 10;

/// What the actor should do after a timer tick ran.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TimerVerdict {
    /// The no-progress tier fired; the connection is poisoned and should
    /// be dropped from the routing table.
    Poisoned,
    /// The aliveness tier fired; the actor must reconnect (or restart
    /// resolution while still connecting).
    TimedOut,
    /// Nothing for the actor to do; the timer re-armed itself if needed.
    Idle,
}

/// Outcome of one timeout sweep.
#[derive(Debug, PartialEq, Eq)]
enum TimeoutCheck {
    /// Backend silence crossed the aliveness window.
    TimedOut,
    /// Re-arm the timer this many ticks out.
    ScheduleIn(u64),
    /// Queue empty; leave the timer disarmed.
    Nothing,
}

impl Connection {
    /// Arm the connection timer `delay` ticks out, if none is armed.
    ///
    /// A queue with a successor delegates liveness to it and never arms.
    /// The delay is clamped into `[0, BACKEND_ALIVE_TIMEOUT_NANOS]` so the
    /// aliveness check always runs often enough.
    pub(crate) fn schedule_timer(self: &Arc<Self>, inner: &mut ConnectionInner, delay: u64) {
        if inner.have_timer {
            debug!("{}: timer already armed on {:?}", self.context.tag(), self);
            return;
        }
        if inner.queue.has_successor() {
            debug!(
                "{}: {:?} has a successor, not arming a timer",
                self.context.tag(),
                self
            );
            return;
        }
        let normalized = delay.min(BACKEND_ALIVE_TIMEOUT_NANOS);
        debug!(
            "{}: arming timer on {:?} in {}ms",
            self.context.tag(),
            self,
            normalized / 1_000_000
        );
        self.context
            .schedule_timer_tick(Arc::downgrade(self), Duration::from_nanos(normalized));
        inner.have_timer = true;
    }

    /// Run one timer tick.
    ///
    /// Checks the no-progress tier, then sweeps for backend silence and
    /// individual request timeouts, re-arming the timer when entries
    /// remain in flight. Completion callbacks run after the lock is
    /// released.
    pub(crate) fn run_timer(self: &Arc<Self>, now: u64) -> TimerVerdict {
        let (verdict, completions) = {
            let mut inner = self.lock_inner();
            inner.have_timer = false;
            debug!("{}: running timer on {:?}", self.context.tag(), self);

            if inner.queue.has_successor() {
                // Retired by a reconnect after this tick was scheduled.
                (TimerVerdict::Idle, Vec::new())
            } else {
                let ticks_since_progress = inner.queue.ticks_stalling(now);
                if ticks_since_progress >= NO_PROGRESS_TIMEOUT_NANOS {
                    let stalled_seconds = ticks_since_progress as f64 * 1e-9;
                    error!(
                        "{}: {:?} has not seen progress in {:.0} seconds, failing all requests",
                        self.context.tag(),
                        self,
                        stalled_seconds
                    );
                    let cause = RequestError::NoProgress { stalled_seconds };
                    let entries = self.locked_poison(&mut inner, &cause);
                    let completions = entries
                        .into_iter()
                        .map(|entry| (entry, cause.clone()))
                        .collect();
                    (TimerVerdict::Poisoned, completions)
                } else {
                    let (check, completions) = self.locked_check_timeout(&mut inner, now);
                    let verdict = match check {
                        TimeoutCheck::TimedOut => {
                            debug!("{}: {:?} timed out", self.context.tag(), self);
                            TimerVerdict::TimedOut
                        }
                        TimeoutCheck::ScheduleIn(delay) => {
                            self.schedule_timer(&mut inner, delay);
                            TimerVerdict::Idle
                        }
                        TimeoutCheck::Nothing => {
                            debug!(
                                "{}: nothing to schedule on {:?}",
                                self.context.tag(),
                                self
                            );
                            TimerVerdict::Idle
                        }
                    };
                    (verdict, completions)
                }
            }
        };

        for (entry, cause) in completions {
            entry.complete(Err(cause));
        }
        verdict
    }

    /// Sweep the queue for timeouts.
    ///
    /// Backend silence is checked first: requests are transmitted in
    /// sequence, so a silent backend says nothing useful about individual
    /// entries. Otherwise entries are swept oldest-first; anything at or
    /// past the request timeout is collected for failure and the remainder
    /// yields the next re-arm delay.
    fn locked_check_timeout(
        &self,
        inner: &mut ConnectionInner,
        now: u64,
    ) -> (TimeoutCheck, Vec<(ConnectionEntry, RequestError)>) {
        if inner.queue.is_empty() {
            return (TimeoutCheck::Nothing, Vec::new());
        }

        let backend_silent_ticks = now.saturating_sub(inner.last_received_ticks);
        if backend_silent_ticks >= BACKEND_ALIVE_TIMEOUT_NANOS {
            debug!(
                "{}: no activity from backend in {}ns, timing {:?} out",
                self.context.tag(),
                backend_silent_ticks,
                self
            );
            return (TimeoutCheck::TimedOut, Vec::new());
        }

        let mut timed_out = Vec::new();
        let check = loop {
            let Some(head) = inner.queue.peek_oldest() else {
                break TimeoutCheck::Nothing;
            };
            let been_open = now.saturating_sub(head.enqueued_ticks());
            if been_open < REQUEST_TIMEOUT_NANOS {
                break TimeoutCheck::ScheduleIn(REQUEST_TIMEOUT_NANOS - been_open);
            }
            if let Some(entry) = inner.queue.remove_oldest(now) {
                debug!("{}: timed out entry {:?}", self.context.tag(), entry);
                timed_out.push((
                    entry,
                    RequestError::TimedOut {
                        elapsed_seconds: been_open as f64 * 1e-9,
                    },
                ));
            }
        };

        if !timed_out.is_empty() {
            debug!(
                "{}: {:?} timed out {} entries",
                self.context.tag(),
                self,
                timed_out.len()
            );
            // Timed-out entries may have vacated the window; refill it.
            inner.queue.try_transmit(now);
        }
        (check, timed_out)
    }
}
