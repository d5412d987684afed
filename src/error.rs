use thiserror::Error;

/// Errors raised by a transport adapter.
///
/// Every variant is a *setup/transport* failure from the container's point of
/// view: when one escapes a receive iteration the polling engine clears its
/// cached resources and runs the recovery protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failure: {0}")]
    Connection(String),
    #[error("illegal transport state: {0}")]
    IllegalState(String),
    #[error("session failure: {0}")]
    Session(String),
    #[error("consumer failure: {0}")]
    Consumer(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("acknowledge failed: {0}")]
    Acknowledge(String),
    #[error("transaction failure: {0}")]
    Transaction(String),
    #[error("could not resolve destination '{0}'")]
    DestinationResolution(String),
    #[error("resource already closed")]
    Closed,
}

impl TransportError {
    /// `true` for errors that only report a harmless state mismatch, such as
    /// starting an already started connection.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, TransportError::IllegalState(_))
    }
}

/// Errors surfaced by the listener container.
#[derive(Error, Debug)]
pub enum ContainerError {
    /// Invalid or missing configuration, fatal at initialize.
    #[error("configuration error: {0}")]
    Config(String),

    /// Broker-side failure while establishing or using consumer resources.
    #[error("listener setup failed: {0}")]
    Setup(#[from] TransportError),

    /// The user message listener returned an error.
    #[error("message listener failed: {0}")]
    Listener(#[source] anyhow::Error),

    /// The user message listener panicked.
    #[error("message listener panicked: {0}")]
    ListenerPanicked(String),

    /// A lifecycle operation was called in a state that does not allow it.
    #[error("illegal container state: {0}")]
    IllegalState(String),

    #[error("the shared connection has not been initialized yet")]
    SharedConnectionNotInitialized,

    /// A message arrived while the container was stopping and was rolled back.
    #[error("rejected message {0} because the container is stopping")]
    MessageRejected(String),
}

impl ContainerError {
    /// Whether this error should drive the recovery protocol.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            ContainerError::Setup(_) | ContainerError::SharedConnectionNotInitialized
        )
    }

    /// Whether this error originates in user message-processing code.
    pub fn is_listener_failure(&self) -> bool {
        matches!(
            self,
            ContainerError::Listener(_) | ContainerError::ListenerPanicked(_)
        )
    }
}

/// Result type alias for container operations
pub type Result<T> = std::result::Result<T, ContainerError>;
