//! Client actor: single-threaded owner of the per-backend connections.
//!
//! The actor multiplexes connections by backend cookie. It consumes one
//! event channel carrying inbound response envelopes, timer ticks and
//! resolution outcomes, and it alone mutates the routing table. Producers
//! interact through a cloneable [`ClientHandle`] and through the
//! [`Connection`] handles it resolves.

mod backoff;
mod context;

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

pub use backoff::ReconnectBackoff;
pub use context::{ClientActorContext, ClientId};

use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, oneshot},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{BackendInfo, BackendInfoResolver, Cookie},
    connection::{Connection, TimerVerdict},
    error::{ClientStopped, RequestError},
    message::ResponseEnvelope,
    ticker::Ticker,
};

/// Events consumed by the actor loop.
pub(crate) enum ActorEvent {
    /// Look up or create the connection for a cookie.
    Connect {
        cookie: Cookie,
        reply: oneshot::Sender<Arc<Connection>>,
    },
    /// Inbound response envelope to route.
    Envelope(ResponseEnvelope),
    /// A connection asked for a timer tick after a delay.
    ArmTimer {
        conn: Weak<Connection>,
        delay: Duration,
    },
    /// A scheduled timer delay elapsed.
    TimerTick { conn: Weak<Connection> },
    /// Backend resolution succeeded.
    Resolved {
        conn: Arc<Connection>,
        info: BackendInfo,
    },
    /// Backend resolution failed; retry with backoff.
    ResolveFailed { conn: Arc<Connection> },
    /// Backoff elapsed; start another resolution attempt.
    StartResolve { conn: Arc<Connection> },
}

/// Configuration of a client actor.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Identity used for logging and diagnostics.
    pub client: ClientId,
    /// Queue depth producers are throttled against before a backend
    /// window is known; also bounds the window once one is.
    pub target_queue_depth: usize,
    /// Backoff applied between backend resolution attempts.
    pub backoff: ReconnectBackoff,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client: ClientId::new("client", 0),
            target_queue_depth: 1_000,
            backoff: ReconnectBackoff::default(),
        }
    }
}

/// Cloneable producer-side handle to a running [`ClientActor`].
#[derive(Clone)]
pub struct ClientHandle {
    events: mpsc::UnboundedSender<ActorEvent>,
}

impl ClientHandle {
    /// Resolve the connection serving `cookie`, creating one (and kicking
    /// off backend resolution) if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`ClientStopped`] if the actor is no longer running.
    pub async fn connection(&self, cookie: Cookie) -> Result<Arc<Connection>, ClientStopped> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(ActorEvent::Connect { cookie, reply })
            .map_err(|_| ClientStopped)?;
        response.await.map_err(|_| ClientStopped)
    }

    /// Deliver an inbound response envelope for routing.
    ///
    /// # Errors
    ///
    /// Returns [`ClientStopped`] if the actor is no longer running.
    pub fn deliver(&self, envelope: ResponseEnvelope) -> Result<(), ClientStopped> {
        self.events
            .send(ActorEvent::Envelope(envelope))
            .map_err(|_| ClientStopped)
    }
}

/// Single-threaded owner of the cookie-to-connection routing table.
pub struct ClientActor {
    context: Arc<ClientActorContext>,
    resolver: Arc<dyn BackendInfoResolver>,
    config: ClientConfig,
    connections: HashMap<Cookie, Arc<Connection>>,
    events: mpsc::UnboundedReceiver<ActorEvent>,
    shutdown: CancellationToken,
    next_session: u64,
}

impl ClientActor {
    /// Build an actor and the handle producers use to reach it.
    ///
    /// The actor does nothing until [`run`](Self::run) is driven, normally
    /// on a dedicated task.
    #[must_use]
    pub fn new(
        config: ClientConfig,
        resolver: Arc<dyn BackendInfoResolver>,
        ticker: Arc<dyn Ticker>,
        shutdown: CancellationToken,
    ) -> (Self, ClientHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let context = Arc::new(ClientActorContext::new(
            config.client.clone(),
            config.target_queue_depth,
            ticker,
            events_tx.clone(),
        ));
        (
            Self {
                context,
                resolver,
                config,
                connections: HashMap::new(),
                events: events_rx,
                shutdown,
                next_session: 0,
            },
            ClientHandle { events: events_tx },
        )
    }

    /// Shared context handed to this actor's connections.
    #[must_use]
    pub fn context(&self) -> &Arc<ClientActorContext> { &self.context }

    /// Drive the actor until shutdown is requested or every handle is
    /// dropped. On exit, every live connection is poisoned so no queued
    /// entry is left without its completion.
    pub async fn run(mut self) {
        info!("{}: client actor started", self.context.tag());
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        info!(
            "{}: client actor stopping, failing {} connections",
            self.context.tag(),
            self.connections.len()
        );
        for (_, conn) in self.connections.drain() {
            conn.poison(RequestError::Stopped);
        }
    }

    fn handle_event(&mut self, event: ActorEvent) {
        match event {
            ActorEvent::Connect { cookie, reply } => {
                let conn = self.connection(cookie);
                let _ = reply.send(conn);
            }
            ActorEvent::Envelope(envelope) => self.route_envelope(&envelope),
            ActorEvent::ArmTimer { conn, delay } => self.arm_timer(conn, delay),
            ActorEvent::TimerTick { conn } => {
                if let Some(conn) = conn.upgrade() {
                    self.timer_tick(conn);
                }
            }
            ActorEvent::Resolved { conn, info } => self.backend_resolved(conn, info),
            ActorEvent::ResolveFailed { conn } => self.resolve_failed(conn),
            ActorEvent::StartResolve { conn } => self.start_resolve(conn),
        }
    }

    /// Connection serving `cookie`, created on first use. A poisoned
    /// leftover is replaced so the cookie stays usable.
    fn connection(&mut self, cookie: Cookie) -> Arc<Connection> {
        if let Some(conn) = self.connections.get(&cookie) {
            if conn.poisoned().is_none() {
                return Arc::clone(conn);
            }
        }
        debug!(
            "{}: creating connection for backend {}",
            self.context.tag(),
            cookie
        );
        let conn = Connection::connecting(Arc::clone(&self.context), cookie);
        self.connections.insert(cookie, Arc::clone(&conn));
        self.spawn_resolve(Arc::clone(&conn), None);
        conn
    }

    fn route_envelope(&self, envelope: &ResponseEnvelope) {
        match self.connections.get(&envelope.cookie()) {
            Some(conn) => conn.receive_response(envelope),
            None => debug!(
                "{}: no connection for backend {}, dropping envelope",
                self.context.tag(),
                envelope.cookie()
            ),
        }
    }

    fn arm_timer(&self, conn: Weak<Connection>, delay: Duration) {
        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            sleep(delay).await;
            context.send_event(ActorEvent::TimerTick { conn });
        });
    }

    fn timer_tick(&mut self, conn: Arc<Connection>) {
        let now = self.context.ticks_now();
        match conn.run_timer(now) {
            TimerVerdict::Idle => {}
            TimerVerdict::Poisoned => {
                info!(
                    "{}: dropping poisoned connection for backend {}",
                    self.context.tag(),
                    conn.cookie()
                );
                self.remove_connection(&conn);
            }
            TimerVerdict::TimedOut => self.reconnect(conn),
        }
    }

    /// Reconnect sequencing after the aliveness tier fired.
    ///
    /// A connected connection is drained into a fresh successor which then
    /// resolves against the directory; the routing table keeps pointing at
    /// the predecessor (which forwards) until the successor connects. A
    /// still-connecting connection just restarts resolution with backoff.
    fn reconnect(&mut self, conn: Arc<Connection>) {
        let cookie = conn.cookie();
        let now = self.context.ticks_now();
        match conn.backend_info() {
            Some(stale) => {
                info!(
                    "{}: backend {} silent for {:.1}s, reconnecting: {}",
                    self.context.tag(),
                    cookie,
                    conn.backend_silent_ticks(now) as f64 * 1e-9,
                    RequestError::ConnectionTimedOut
                );
                let successor = Connection::connecting(Arc::clone(&self.context), cookie);
                conn.begin_reconnect(&successor);
                self.spawn_resolve(successor, Some(stale));
            }
            None => {
                let attempt = conn.restart_connecting(now);
                if attempt == 0 {
                    return;
                }
                let delay = self.config.backoff.delay_for_attempt(attempt);
                debug!(
                    "{}: backend {} resolution attempt {} in {:?}",
                    self.context.tag(),
                    cookie,
                    attempt,
                    delay
                );
                self.schedule_resolve(conn, delay);
            }
        }
    }

    fn backend_resolved(&mut self, conn: Arc<Connection>, info: BackendInfo) {
        let session_id = self.next_session;
        if conn.complete_connect(info, session_id) {
            self.next_session += 1;
            // Swap the routing table to the freshly connected connection,
            // retiring a forwarding predecessor if one was in place.
            self.connections.insert(conn.cookie(), conn);
        }
    }

    fn resolve_failed(&mut self, conn: Arc<Connection>) {
        if conn.poisoned().is_some() {
            self.remove_connection(&conn);
            return;
        }
        let attempt = conn.note_resolve_failure();
        if attempt == 0 {
            return;
        }
        let delay = self.config.backoff.delay_for_attempt(attempt);
        warn!(
            "{}: backend {} resolution failed, retrying (attempt {}) in {:?}",
            self.context.tag(),
            conn.cookie(),
            attempt,
            delay
        );
        self.schedule_resolve(conn, delay);
    }

    fn start_resolve(&mut self, conn: Arc<Connection>) {
        if conn.poisoned().is_some() {
            self.remove_connection(&conn);
            return;
        }
        if conn.connecting_attempts().is_none() {
            return;
        }
        self.spawn_resolve(conn, None);
    }

    fn schedule_resolve(&self, conn: Arc<Connection>, delay: Duration) {
        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            sleep(delay).await;
            context.send_event(ActorEvent::StartResolve { conn });
        });
    }

    fn spawn_resolve(&self, conn: Arc<Connection>, stale: Option<BackendInfo>) {
        let resolver = Arc::clone(&self.resolver);
        let context = Arc::clone(&self.context);
        tokio::spawn(async move {
            let cookie = conn.cookie();
            let result = match stale {
                Some(stale) => resolver.refresh(cookie, stale).await,
                None => resolver.resolve(cookie).await,
            };
            match result {
                Ok(info) => context.send_event(ActorEvent::Resolved { conn, info }),
                Err(err) => {
                    warn!(
                        "{}: resolving backend {} failed: {}",
                        context.tag(),
                        cookie,
                        err
                    );
                    context.send_event(ActorEvent::ResolveFailed { conn });
                }
            }
        });
    }

    fn remove_connection(&mut self, conn: &Arc<Connection>) {
        if let Some(current) = self.connections.get(&conn.cookie()) {
            if Arc::ptr_eq(current, conn) {
                self.connections.remove(&conn.cookie());
            }
        }
    }
}
