//! Queued request records.

use std::fmt;

use crate::message::{RequestMessage, Response};

/// Completion callback attached to an enqueued request.
///
/// Invoked exactly once, with the matched response, a timeout, or the
/// poison cause.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send + 'static>;

/// A request queued on a connection together with its completion callback
/// and the tick it was enqueued at.
pub struct ConnectionEntry {
    request: RequestMessage,
    callback: ResponseCallback,
    enqueued_ticks: u64,
}

impl ConnectionEntry {
    /// Record a request for queueing.
    #[must_use]
    pub fn new(request: RequestMessage, callback: ResponseCallback, enqueued_ticks: u64) -> Self {
        Self {
            request,
            callback,
            enqueued_ticks,
        }
    }

    /// The queued request.
    #[must_use]
    pub fn request(&self) -> &RequestMessage { &self.request }

    /// Tick at which the request was enqueued.
    #[must_use]
    pub fn enqueued_ticks(&self) -> u64 { self.enqueued_ticks }

    /// Complete the entry, consuming it.
    pub fn complete(self, response: Response) { (self.callback)(response) }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("enqueued_ticks", &self.enqueued_ticks)
            .finish_non_exhaustive()
    }
}

/// A [`ConnectionEntry`] that has been handed to a backend, decorated with
/// the session and sequence it was transmitted under.
pub struct TransmittedEntry {
    entry: ConnectionEntry,
    session_id: u64,
    tx_sequence: u64,
    transmitted_ticks: u64,
}

impl TransmittedEntry {
    pub(crate) fn new(
        entry: ConnectionEntry,
        session_id: u64,
        tx_sequence: u64,
        transmitted_ticks: u64,
    ) -> Self {
        Self {
            entry,
            session_id,
            tx_sequence,
            transmitted_ticks,
        }
    }

    /// Session the entry was transmitted under.
    #[must_use]
    pub fn session_id(&self) -> u64 { self.session_id }

    /// Transmit sequence within the session.
    #[must_use]
    pub fn tx_sequence(&self) -> u64 { self.tx_sequence }

    /// Tick at which the entry was handed to the backend.
    #[must_use]
    pub fn transmitted_ticks(&self) -> u64 { self.transmitted_ticks }

    /// The underlying queued entry.
    #[must_use]
    pub fn entry(&self) -> &ConnectionEntry { &self.entry }

    /// Strip the transmit decoration, e.g. when draining for replay.
    #[must_use]
    pub fn into_entry(self) -> ConnectionEntry { self.entry }

    /// Complete the underlying entry, consuming it.
    pub fn complete(self, response: Response) { self.entry.complete(response) }
}

impl fmt::Debug for TransmittedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransmittedEntry")
            .field("session_id", &self.session_id)
            .field("tx_sequence", &self.tx_sequence)
            .field("transmitted_ticks", &self.transmitted_ticks)
            .field("enqueued_ticks", &self.entry.enqueued_ticks)
            .finish_non_exhaustive()
    }
}
