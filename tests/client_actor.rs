//! End-to-end tests for the `ClientActor` driving real connections.
//!
//! These cover backlog dispatch, response routing, silence-driven
//! reconnects with replay, the terminal no-progress tier, producer
//! backpressure and shutdown hygiene, all under a paused runtime clock.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use shardlink::{
    AbiVersion,
    BackendEndpoint,
    BackendInfo,
    BackendInfoResolver,
    ClientActor,
    ClientConfig,
    ClientHandle,
    Cookie,
    MAX_DELAY_NANOS,
    NO_PROGRESS_TIMEOUT_NANOS,
    RequestEnvelope,
    RequestError,
    RequestMessage,
    ResolveError,
    Response,
    ResponseEnvelope,
    ResponseCallback,
    TokioTicker,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Resolver handing out a fixed sequence of backend descriptors.
struct ScriptedResolver {
    infos: Mutex<VecDeque<BackendInfo>>,
    calls: AtomicUsize,
}

impl ScriptedResolver {
    fn new(infos: Vec<BackendInfo>) -> Arc<Self> {
        Arc::new(Self {
            infos: Mutex::new(infos.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl BackendInfoResolver for ScriptedResolver {
    async fn resolve(&self, cookie: Cookie) -> Result<BackendInfo, ResolveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.infos
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .ok_or(ResolveError::UnknownBackend(cookie))
    }
}

/// Resolver whose resolution never completes.
struct NeverResolver;

#[async_trait]
impl BackendInfoResolver for NeverResolver {
    async fn resolve(&self, _cookie: Cookie) -> Result<BackendInfo, ResolveError> {
        std::future::pending().await
    }
}

fn backend(max_messages: usize) -> (BackendInfo, mpsc::UnboundedReceiver<RequestEnvelope>) {
    let (endpoint, rx) = BackendEndpoint::channel();
    (
        BackendInfo::new(endpoint, AbiVersion::CURRENT, max_messages),
        rx,
    )
}

fn spawn_client(
    resolver: Arc<dyn BackendInfoResolver>,
) -> (ClientHandle, CancellationToken) {
    let shutdown = CancellationToken::new();
    let (actor, handle) = ClientActor::new(
        ClientConfig::default(),
        resolver,
        Arc::new(TokioTicker::new()),
        shutdown.clone(),
    );
    tokio::spawn(actor.run());
    (handle, shutdown)
}

fn request(tag: &'static str) -> RequestMessage { RequestMessage::new(Bytes::from_static(tag.as_bytes())) }

fn oneshot_callback() -> (ResponseCallback, oneshot::Receiver<Response>) {
    let (tx, rx) = oneshot::channel();
    (
        Box::new(move |response| {
            let _ = tx.send(response);
        }),
        rx,
    )
}

fn reply_to(envelope: &RequestEnvelope, cookie: Cookie, payload: &'static [u8]) -> ResponseEnvelope {
    ResponseEnvelope::success(
        cookie,
        envelope.session_id(),
        envelope.tx_sequence(),
        1,
        Bytes::from_static(payload),
    )
}

#[tokio::test(start_paused = true)]
async fn backlog_dispatches_in_order_and_completes_through_the_window() {
    let cookie = Cookie(1);
    let (info, mut transport) = backend(2);
    let resolver = ScriptedResolver::new(vec![info]);
    let (handle, _shutdown) = spawn_client(resolver);

    let conn = handle.connection(cookie).await.expect("actor running");
    let mut callbacks = Vec::new();
    for tag in ["r1", "r2", "r3"] {
        let (callback, rx) = oneshot_callback();
        conn.send_request(request(tag), callback)
            .await
            .expect("not poisoned");
        callbacks.push(rx);
    }

    let first = transport.recv().await.expect("transmitted");
    let second = transport.recv().await.expect("transmitted");
    assert_eq!(first.tx_sequence(), 0);
    assert_eq!(second.tx_sequence(), 1);
    assert!(
        transport.try_recv().is_err(),
        "window of two holds the third request back"
    );

    handle
        .deliver(reply_to(&first, cookie, b"done-1"))
        .expect("actor running");

    let response = callbacks
        .remove(0)
        .await
        .expect("callback fired")
        .expect("success");
    assert_eq!(response.payload(), &Bytes::from_static(b"done-1"));

    let third = transport.recv().await.expect("window refilled");
    assert_eq!(third.tx_sequence(), 2);
}

#[tokio::test(start_paused = true)]
async fn responses_complete_out_of_order_without_disturbing_in_flight_entries() {
    let cookie = Cookie(4);
    let (info, mut transport) = backend(2);
    let resolver = ScriptedResolver::new(vec![info]);
    let (handle, _shutdown) = spawn_client(resolver);

    let conn = handle.connection(cookie).await.expect("actor running");
    let (first_callback, mut first_rx) = oneshot_callback();
    let (second_callback, second_rx) = oneshot_callback();
    conn.send_request(request("r1"), first_callback)
        .await
        .expect("not poisoned");
    conn.send_request(request("r2"), second_callback)
        .await
        .expect("not poisoned");

    let first = transport.recv().await.expect("transmitted");
    let second = transport.recv().await.expect("transmitted");

    handle
        .deliver(reply_to(&second, cookie, b"done-2"))
        .expect("actor running");
    let response = second_rx.await.expect("callback fired").expect("success");
    assert_eq!(response.payload(), &Bytes::from_static(b"done-2"));
    assert!(
        first_rx.try_recv().is_err(),
        "older entry must stay in flight"
    );

    handle
        .deliver(reply_to(&first, cookie, b"done-1"))
        .expect("actor running");
    let response = first_rx.await.expect("callback fired").expect("success");
    assert_eq!(response.payload(), &Bytes::from_static(b"done-1"));
}

#[tokio::test(start_paused = true)]
async fn silent_backend_is_reconnected_and_requests_replayed() {
    let cookie = Cookie(2);
    let (first_info, mut first_transport) = backend(4);
    let (second_info, mut second_transport) = backend(4);
    let resolver = ScriptedResolver::new(vec![first_info, second_info]);
    let (handle, _shutdown) = spawn_client(Arc::clone(&resolver) as Arc<dyn BackendInfoResolver>);

    let conn = handle.connection(cookie).await.expect("actor running");
    let (callback, rx) = oneshot_callback();
    conn.send_request(request("r1"), callback)
        .await
        .expect("not poisoned");

    let original = first_transport.recv().await.expect("transmitted");
    assert_eq!(original.session_id(), 0);
    assert_eq!(original.tx_sequence(), 0);

    // No response: the aliveness tier fires and the request replays on a
    // fresh backend under a fresh session.
    let replayed = second_transport.recv().await.expect("replayed");
    assert_eq!(replayed.session_id(), 1);
    assert_eq!(replayed.tx_sequence(), 0);
    assert_eq!(replayed.message().payload(), &Bytes::from_static(b"r1"));
    assert_eq!(resolver.calls(), 2, "reconnect re-resolved the backend");

    handle
        .deliver(reply_to(&replayed, cookie, b"done"))
        .expect("actor running");
    let response = rx.await.expect("callback fired exactly once").expect("success");
    assert_eq!(response.payload(), &Bytes::from_static(b"done"));
}

#[tokio::test(start_paused = true)]
async fn unresolvable_backend_poisons_after_the_no_progress_window() {
    let cookie = Cookie(3);
    let (handle, _shutdown) = spawn_client(Arc::new(NeverResolver));

    let started = tokio::time::Instant::now();
    let conn = handle.connection(cookie).await.expect("actor running");
    let (callback, rx) = oneshot_callback();
    conn.send_request(request("r1"), callback)
        .await
        .expect("not poisoned");

    let response = rx.await.expect("poison completes the entry");
    assert!(matches!(
        response.expect_err("poisoned"),
        RequestError::NoProgress { .. }
    ));
    assert!(
        started.elapsed() >= Duration::from_nanos(NO_PROGRESS_TIMEOUT_NANOS),
        "termination must wait out the full no-progress window"
    );

    let (callback, _rx) = oneshot_callback();
    let err = conn
        .send_request(request("r2"), callback)
        .await
        .expect_err("poisoned connections refuse work");
    assert!(matches!(err.cause(), RequestError::NoProgress { .. }));
}

#[tokio::test(start_paused = true)]
async fn saturated_window_throttles_producers_within_the_cap() {
    let cookie = Cookie(5);
    let (info, mut transport) = backend(1);
    let resolver = ScriptedResolver::new(vec![info]);
    let (handle, _shutdown) = spawn_client(resolver);

    let conn = handle.connection(cookie).await.expect("actor running");
    let max_delay = Duration::from_nanos(MAX_DELAY_NANOS);
    let mut cumulative = Duration::ZERO;
    for round in 0..50u32 {
        let before = tokio::time::Instant::now();
        let (callback, rx) = oneshot_callback();
        conn.send_request(request("r"), callback)
            .await
            .expect("not poisoned");
        let slept = before.elapsed();
        assert!(slept <= max_delay, "delay exceeded the cap on round {round}");
        cumulative += slept;

        let envelope = transport.recv().await.expect("transmitted");
        handle
            .deliver(reply_to(&envelope, cookie, b"ok"))
            .expect("actor running");
        rx.await.expect("callback fired").expect("success");
    }
    assert!(cumulative > Duration::ZERO, "a window of one must throttle");
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_queued_entries_and_refuses_new_work() {
    let cookie = Cookie(6);
    let (handle, shutdown) = spawn_client(Arc::new(NeverResolver));

    let conn = handle.connection(cookie).await.expect("actor running");
    let (callback, rx) = oneshot_callback();
    conn.send_request(request("r1"), callback)
        .await
        .expect("not poisoned");

    shutdown.cancel();

    let response = rx.await.expect("shutdown completes the entry");
    assert_eq!(response.expect_err("stopped"), RequestError::Stopped);
    assert!(
        handle.connection(cookie).await.is_err(),
        "a stopped actor hands out no connections"
    );
}
