//! Shared context handed to every connection of a client actor.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use tokio::sync::mpsc;

use super::ActorEvent;
use crate::{connection::Connection, ticker::Ticker};

/// Identity of a client instance, used as the log tag and carried for
/// diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId {
    name: String,
    generation: u64,
}

impl ClientId {
    /// Identify a client by name and generation.
    #[must_use]
    pub fn new(name: impl Into<String>, generation: u64) -> Self {
        Self {
            name: name.into(),
            generation,
        }
    }

    /// Client name.
    #[must_use]
    pub fn name(&self) -> &str { &self.name }

    /// Client generation.
    #[must_use]
    pub fn generation(&self) -> u64 { self.generation }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.generation)
    }
}

/// Clock, identity and actor-channel access shared by the actor and its
/// connections.
///
/// Connections use it to read ticks and to get timer ticks scheduled back
/// onto the actor; they never touch the actor's state directly.
pub struct ClientActorContext {
    client: ClientId,
    tag: String,
    target_queue_depth: usize,
    ticker: Arc<dyn Ticker>,
    events: mpsc::UnboundedSender<ActorEvent>,
}

impl ClientActorContext {
    pub(crate) fn new(
        client: ClientId,
        target_queue_depth: usize,
        ticker: Arc<dyn Ticker>,
        events: mpsc::UnboundedSender<ActorEvent>,
    ) -> Self {
        let tag = client.to_string();
        Self {
            client,
            tag,
            target_queue_depth,
            ticker,
            events,
        }
    }

    /// Identity of the owning client.
    #[must_use]
    pub fn identifier(&self) -> &ClientId { &self.client }

    /// Log tag of the owning client.
    #[must_use]
    pub fn tag(&self) -> &str { &self.tag }

    /// Current monotonic tick reading.
    pub(crate) fn ticks_now(&self) -> u64 { self.ticker.read() }

    /// Queue depth connections throttle against before a backend window is
    /// known.
    pub(crate) fn target_queue_depth(&self) -> usize { self.target_queue_depth }

    /// Ask the actor to deliver a timer tick to `conn` after `delay`.
    ///
    /// Silently dropped when the actor has stopped; the actor poisons its
    /// connections on the way out, so no entry is left waiting on a timer.
    pub(crate) fn schedule_timer_tick(&self, conn: Weak<Connection>, delay: Duration) {
        let _ = self.events.send(ActorEvent::ArmTimer { conn, delay });
    }

    pub(crate) fn send_event(&self, event: ActorEvent) { let _ = self.events.send(event); }
}

impl fmt::Debug for ClientActorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientActorContext")
            .field("client", &self.tag)
            .field("target_queue_depth", &self.target_queue_depth)
            .finish_non_exhaustive()
    }
}
