//! Backend identity, resolved descriptors and the resolution seam.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{error::ResolveError, message::RequestEnvelope};

/// Opaque stable identifier for a backend shard within a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(pub u64);

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { self.0.fmt(f) }
}

/// Version tag governing the envelope shape a backend understands.
///
/// Envelopes are always stamped with a version bounded to the newest one
/// this client can produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AbiVersion(pub u16);

impl AbiVersion {
    /// Newest envelope shape this client produces.
    pub const CURRENT: AbiVersion = AbiVersion(1);

    /// Bound `self` to [`AbiVersion::CURRENT`].
    #[must_use]
    pub fn bounded(self) -> Self { self.min(Self::CURRENT) }
}

/// Delivery handle for request envelopes bound for one backend instance.
///
/// The handle fronts an unbounded channel: sends never block, which lets the
/// transmit queue hand envelopes to the transport while the connection lock
/// is held. The receiving half belongs to whatever drives the wire.
#[derive(Clone)]
pub struct BackendEndpoint {
    tx: mpsc::UnboundedSender<RequestEnvelope>,
}

impl BackendEndpoint {
    /// Create an endpoint and the receiver its envelopes arrive on.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RequestEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand an envelope to the transport.
    ///
    /// Returns `false` when the receiving half is gone; the caller keeps the
    /// entry in flight and lets the aliveness tier drive a reconnect.
    pub(crate) fn send(&self, envelope: RequestEnvelope) -> bool { self.tx.send(envelope).is_ok() }
}

impl fmt::Debug for BackendEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendEndpoint")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Resolved descriptor of a backend: where to send, which envelope shape it
/// speaks, and how many requests it accepts in flight.
#[derive(Clone, Debug)]
pub struct BackendInfo {
    endpoint: BackendEndpoint,
    version: AbiVersion,
    max_messages: usize,
}

impl BackendInfo {
    /// Describe a backend instance.
    #[must_use]
    pub fn new(endpoint: BackendEndpoint, version: AbiVersion, max_messages: usize) -> Self {
        Self {
            endpoint,
            version,
            max_messages,
        }
    }

    /// Envelope delivery handle.
    #[must_use]
    pub fn endpoint(&self) -> &BackendEndpoint { &self.endpoint }

    /// Envelope shape the backend advertised.
    #[must_use]
    pub fn version(&self) -> AbiVersion { self.version }

    /// In-flight window advertised by the backend.
    #[must_use]
    pub fn max_messages(&self) -> usize { self.max_messages }
}

/// Asynchronous shard-location directory.
///
/// The connection core only consumes this seam; providing it is the
/// embedding application's job.
#[async_trait]
pub trait BackendInfoResolver: Send + Sync {
    /// Resolve a cookie to a live backend descriptor.
    async fn resolve(&self, cookie: Cookie) -> Result<BackendInfo, ResolveError>;

    /// Re-resolve after a connection to `stale` timed out.
    ///
    /// Directories that cache descriptors should invalidate `stale` before
    /// resolving again. The default ignores the hint.
    async fn refresh(&self, cookie: Cookie, stale: BackendInfo) -> Result<BackendInfo, ResolveError> {
        let _ = stale;
        self.resolve(cookie).await
    }
}
