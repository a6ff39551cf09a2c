//! Error types for backend connections.

use thiserror::Error;

use crate::backend::Cookie;

/// Failure cause delivered to a request's completion callback.
///
/// Per-entry failures (`TimedOut`, `RemoteFailure`) leave the connection
/// running. Connection-wide causes (`NoProgress`, `Stopped`) arrive through
/// poisoning and fail every queued entry. `ConnectionTimedOut` drives the
/// reconnect path and is never seen by callers directly.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum RequestError {
    /// The request sat unanswered past the per-request timeout.
    #[error("request timed out after {elapsed_seconds} seconds")]
    TimedOut {
        /// Seconds between enqueue and the timeout sweep.
        elapsed_seconds: f64,
    },
    /// The connection made no forward progress for the terminal window.
    #[error("no forward progress in {stalled_seconds} seconds")]
    NoProgress {
        /// Seconds since the queue last completed an entry.
        stalled_seconds: f64,
    },
    /// The backend went silent past the aliveness window.
    #[error("backend connection timed out")]
    ConnectionTimedOut,
    /// A failure envelope arrived in place of a success response.
    #[error("backend request failed: {message}")]
    RemoteFailure {
        /// Failure message body carried by the envelope.
        message: String,
    },
    /// The client actor stopped before the request completed.
    #[error("client connection stopped")]
    Stopped,
}

/// Synchronous refusal returned by enqueue operations once a connection has
/// been poisoned. Carries the original poison cause.
#[derive(Clone, Debug, Error)]
#[error("connection to backend {cookie} has been poisoned: {cause}")]
pub struct PoisonedError {
    cookie: Cookie,
    #[source]
    cause: RequestError,
}

impl PoisonedError {
    pub(crate) fn new(cookie: Cookie, cause: RequestError) -> Self { Self { cookie, cause } }

    /// Backend whose connection refused the enqueue.
    #[must_use]
    pub fn cookie(&self) -> Cookie { self.cookie }

    /// The cause the connection was poisoned with.
    #[must_use]
    pub fn cause(&self) -> &RequestError { &self.cause }
}

/// Failure reported by a [`BackendInfoResolver`](crate::BackendInfoResolver).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ResolveError {
    /// The directory has no record of the backend.
    #[error("backend {0} is unknown")]
    UnknownBackend(Cookie),
    /// Resolution failed for a reason worth retrying.
    #[error("backend resolution failed: {0}")]
    Unavailable(String),
}

/// The client actor is no longer accepting work.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("client actor has stopped")]
pub struct ClientStopped;
