//! Transport abstraction consumed by the listener container.
//!
//! These traits are the only view the container has of a message broker. An
//! adapter over a real broker client implements them; the in-memory broker in
//! [`crate::memory`] is the reference implementation used by the tests.
//!
//! The container never interprets payloads, addressing, or wire formats. It
//! only needs to open connections and sessions, create consumers, receive with
//! a bounded timeout, and drive acknowledgement / local transactions.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::destination::Destination;
use crate::error::TransportError;

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Shared connection factory pointer.
pub type ConnectionFactoryPtr = Arc<dyn ConnectionFactory>;

/// Shared connection pointer. Cloning only bumps a reference count.
pub type ConnectionPtr = Arc<dyn Connection>;

/// Shared session pointer.
///
/// Sessions are reference counted so a session-aware listener can hold on to
/// the session it was invoked with for the duration of its future.
pub type SessionPtr = Arc<dyn Session>;

/// Shared message pointer handed to listeners.
pub type MessagePtr = Arc<dyn Message>;

/// Session acknowledgement mode for non-transacted sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Messages are acknowledged by the transport when `receive` returns.
    #[default]
    Auto,
    /// The container acknowledges explicitly after a successful listener call.
    Client,
    /// Lazy acknowledgement, duplicates are tolerated.
    DupsOk,
}

impl AckMode {
    /// Numeric code used by the classic broker APIs
    pub fn as_i32(self) -> i32 {
        match self {
            AckMode::Auto => 1,
            AckMode::Client => 2,
            AckMode::DupsOk => 3,
        }
    }

    /// Parse the numeric code used by the classic broker APIs
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            1 => Some(AckMode::Auto),
            2 => Some(AckMode::Client),
            3 => Some(AckMode::DupsOk),
            _ => None,
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => write!(f, "auto"),
            AckMode::Client => write!(f, "client"),
            AckMode::DupsOk => write!(f, "dups_ok"),
        }
    }
}

/// Creates broker connections.
#[async_trait::async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(&self) -> TransportResult<ConnectionPtr>;
}

/// A broker connection.
///
/// A connection delivers messages to its consumers only while started.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Transport-assigned identifier, used for logging only.
    fn id(&self) -> &str;

    /// Assign the client id. Only valid before the connection is started.
    async fn set_client_id(&self, client_id: &str) -> TransportResult<()>;

    async fn start(&self) -> TransportResult<()>;

    async fn stop(&self) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;

    async fn create_session(&self, transacted: bool, ack_mode: AckMode)
        -> TransportResult<SessionPtr>;
}

/// A single-threaded context for producing and consuming messages.
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Create a consumer on `destination`.
    ///
    /// `no_local` is only meaningful for topic destinations.
    async fn create_consumer(
        &self,
        destination: &Destination,
        selector: Option<&str>,
        no_local: bool,
    ) -> TransportResult<Box<dyn Consumer>>;

    fn is_transacted(&self) -> bool;

    fn acknowledge_mode(&self) -> AckMode;

    async fn commit(&self) -> TransportResult<()>;

    async fn rollback(&self) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}

/// Receives messages from a destination.
#[async_trait::async_trait]
pub trait Consumer: Send {
    /// Wait for the next message.
    ///
    /// `None` as timeout blocks until a message arrives. `Ok(None)` means the
    /// timeout elapsed without a message and is not an error.
    async fn receive(&mut self, timeout: Option<Duration>) -> TransportResult<Option<MessagePtr>>;

    async fn close(&mut self) -> TransportResult<()>;
}

/// A received message.
#[async_trait::async_trait]
pub trait Message: Send + Sync + fmt::Debug {
    fn message_id(&self) -> &str;

    fn destination(&self) -> &Destination;

    fn body(&self) -> &Bytes;

    fn headers(&self) -> &HashMap<String, String>;

    /// Whether the broker delivered this message before.
    fn redelivered(&self) -> bool;

    /// Acknowledge this message (and, per client-ack semantics, every message
    /// consumed before it on the same session).
    async fn acknowledge(&self) -> TransportResult<()>;

    /// Body as UTF-8 text, if it is valid UTF-8.
    fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(self.body()).ok()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).map(|value| value.as_str())
    }
}
