#![doc(html_root_url = "https://docs.rs/shardlink/latest")]
//! Public API for the `shardlink` library.
//!
//! This crate provides the client-side connection core of a sharded
//! data-store access layer: per-backend connections that queue requests,
//! dispatch them once the backend is resolved, throttle producers, enforce
//! a tiered timeout regime and replay in-flight work across reconnects.
//!
//! The [`ClientActor`] owns one [`Connection`] per backend cookie and runs
//! as a single task; producers obtain connection handles through a
//! [`ClientHandle`] and submit work with [`Connection::send_request`].
//! Backend discovery stays behind the [`BackendInfoResolver`] seam and the
//! wire stays behind [`BackendEndpoint`]; this crate moves envelopes, not
//! bytes on sockets.

pub mod actor;
pub mod backend;
pub mod entry;
pub mod error;
pub mod message;
pub mod ticker;

pub mod connection;
mod queue;

pub use actor::{ClientActor, ClientActorContext, ClientConfig, ClientHandle, ClientId, ReconnectBackoff};
pub use backend::{AbiVersion, BackendEndpoint, BackendInfo, BackendInfoResolver, Cookie};
pub use connection::{
    BACKEND_ALIVE_TIMEOUT_NANOS,
    Connection,
    DEBUG_DELAY_NANOS,
    MAX_DELAY_NANOS,
    NO_PROGRESS_TIMEOUT_NANOS,
    REQUEST_TIMEOUT_NANOS,
};
pub use entry::{ConnectionEntry, ResponseCallback, TransmittedEntry};
pub use error::{ClientStopped, PoisonedError, RequestError, ResolveError};
pub use message::{
    RequestEnvelope,
    RequestMessage,
    Response,
    ResponseBody,
    ResponseEnvelope,
    ResponseMessage,
};
pub use ticker::{ManualTicker, SystemTicker, Ticker, TokioTicker};
