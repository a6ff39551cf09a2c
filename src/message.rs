//! Request and response messages and their on-wire envelopes.
//!
//! Payloads are opaque [`Bytes`]; serialization of the bodies is the
//! embedding application's concern. Envelopes add the `(session, sequence)`
//! identity the transmit queue matches responses against.

use bytes::Bytes;

use crate::{
    backend::{AbiVersion, Cookie},
    error::RequestError,
};

/// Outcome delivered to a request's completion callback.
pub type Response = Result<ResponseMessage, RequestError>;

/// An application request bound for a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestMessage {
    payload: Bytes,
}

impl RequestMessage {
    /// Wrap an opaque request payload.
    #[must_use]
    pub fn new(payload: Bytes) -> Self { Self { payload } }

    /// The request payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }
}

/// A successful response returned to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponseMessage {
    payload: Bytes,
    execution_time_ticks: u64,
}

impl ResponseMessage {
    /// Wrap a response payload together with the backend's reported
    /// execution time.
    #[must_use]
    pub fn new(payload: Bytes, execution_time_ticks: u64) -> Self {
        Self {
            payload,
            execution_time_ticks,
        }
    }

    /// The response payload.
    #[must_use]
    pub fn payload(&self) -> &Bytes { &self.payload }

    /// Backend-reported execution time in ticks.
    #[must_use]
    pub fn execution_time_ticks(&self) -> u64 { self.execution_time_ticks }
}

/// Body of a response envelope: success payload or failure message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseBody {
    /// The request succeeded.
    Success(Bytes),
    /// The backend reports the request failed.
    Failure(String),
}

/// On-wire container for a transmitted request.
///
/// Built at transmit time, never earlier: the version stamp depends on the
/// resolved backend and sequences are assigned per session.
#[derive(Clone, Debug)]
pub struct RequestEnvelope {
    session_id: u64,
    tx_sequence: u64,
    version: AbiVersion,
    message: RequestMessage,
}

impl RequestEnvelope {
    pub(crate) fn new(
        session_id: u64,
        tx_sequence: u64,
        version: AbiVersion,
        message: RequestMessage,
    ) -> Self {
        Self {
            session_id,
            tx_sequence,
            version,
            message,
        }
    }

    /// Session the envelope was transmitted under.
    #[must_use]
    pub fn session_id(&self) -> u64 { self.session_id }

    /// Transmit sequence within the session.
    #[must_use]
    pub fn tx_sequence(&self) -> u64 { self.tx_sequence }

    /// Envelope shape version, bounded to what this client produces.
    #[must_use]
    pub fn version(&self) -> AbiVersion { self.version }

    /// The request message.
    #[must_use]
    pub fn message(&self) -> &RequestMessage { &self.message }
}

/// On-wire container for a backend's reply.
///
/// The cookie identifies the owning connection so the client actor can
/// route without inspecting payloads.
#[derive(Clone, Debug)]
pub struct ResponseEnvelope {
    cookie: Cookie,
    session_id: u64,
    tx_sequence: u64,
    execution_time_ticks: u64,
    message: ResponseBody,
}

impl ResponseEnvelope {
    /// Build a success envelope.
    #[must_use]
    pub fn success(
        cookie: Cookie,
        session_id: u64,
        tx_sequence: u64,
        execution_time_ticks: u64,
        payload: Bytes,
    ) -> Self {
        Self {
            cookie,
            session_id,
            tx_sequence,
            execution_time_ticks,
            message: ResponseBody::Success(payload),
        }
    }

    /// Build a failure envelope sharing the success shell.
    #[must_use]
    pub fn failure(
        cookie: Cookie,
        session_id: u64,
        tx_sequence: u64,
        execution_time_ticks: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            cookie,
            session_id,
            tx_sequence,
            execution_time_ticks,
            message: ResponseBody::Failure(message.into()),
        }
    }

    /// Connection the envelope belongs to.
    #[must_use]
    pub fn cookie(&self) -> Cookie { self.cookie }

    /// Session the original request was transmitted under.
    #[must_use]
    pub fn session_id(&self) -> u64 { self.session_id }

    /// Transmit sequence of the original request.
    #[must_use]
    pub fn tx_sequence(&self) -> u64 { self.tx_sequence }

    /// Backend-reported execution time in ticks.
    #[must_use]
    pub fn execution_time_ticks(&self) -> u64 { self.execution_time_ticks }

    /// The response body.
    #[must_use]
    pub fn message(&self) -> &ResponseBody { &self.message }

    /// Convert the body into the caller-facing [`Response`].
    pub(crate) fn to_response(&self) -> Response {
        match &self.message {
            ResponseBody::Success(payload) => Ok(ResponseMessage::new(
                payload.clone(),
                self.execution_time_ticks,
            )),
            ResponseBody::Failure(message) => Err(RequestError::RemoteFailure {
                message: message.clone(),
            }),
        }
    }
}
