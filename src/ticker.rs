//! Monotonic tick sources.
//!
//! All timing in this crate is expressed in monotonic nanoseconds ("ticks")
//! read from a [`Ticker`]. Keeping raw ticks end-to-end avoids unit
//! conversions on the enqueue and completion fast paths.

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

/// Source of monotonic time in nanoseconds.
pub trait Ticker: Send + Sync {
    /// Current reading of the tick source.
    ///
    /// Successive reads are non-decreasing for the lifetime of the ticker.
    fn read(&self) -> u64;
}

/// Ticker backed by [`std::time::Instant`].
///
/// Usable from any thread without a runtime.
#[derive(Debug)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    /// Create a ticker whose reading starts near zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self { Self::new() }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 { self.origin.elapsed().as_nanos() as u64 }
}

/// Ticker backed by [`tokio::time::Instant`].
///
/// Tracks the runtime clock, so it observes `tokio::time::pause` and
/// `tokio::time::advance` in tests driven with a paused runtime.
#[derive(Debug)]
pub struct TokioTicker {
    origin: tokio::time::Instant,
}

impl TokioTicker {
    /// Create a ticker whose reading starts near zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTicker {
    fn default() -> Self { Self::new() }
}

impl Ticker for TokioTicker {
    fn read(&self) -> u64 { self.origin.elapsed().as_nanos() as u64 }
}

/// Ticker advanced explicitly by tests.
#[derive(Debug, Default)]
pub struct ManualTicker {
    ticks: AtomicU64,
}

impl ManualTicker {
    /// Create a ticker reading zero.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Advance the reading by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.ticks
            .fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Ticker for ManualTicker {
    fn read(&self) -> u64 { self.ticks.load(Ordering::SeqCst) }
}
