use anyhow::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::ContainerError;
use crate::transport::{MessagePtr, SessionPtr};

/// Plain handler: `handler(message)`
pub type PlainHandlerFn = dyn Fn(MessagePtr) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Session-aware handler: `handler(message, session)`
pub type SessionAwareHandlerFn =
    dyn Fn(MessagePtr, SessionPtr) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// A registered message listener in one of the two supported shapes.
#[derive(Clone)]
pub enum MessageListener {
    Plain(Arc<PlainHandlerFn>),
    SessionAware(Arc<SessionAwareHandlerFn>),
}

impl MessageListener {
    /// Wrap an async `Fn(message)`.
    pub fn plain<F, Fut>(handler: F) -> Self
    where
        F: Fn(MessagePtr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        MessageListener::Plain(Arc::new(move |message: MessagePtr| handler(message).boxed()))
    }

    /// Wrap an async `Fn(message, session)`.
    pub fn session_aware<F, Fut>(handler: F) -> Self
    where
        F: Fn(MessagePtr, SessionPtr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        MessageListener::SessionAware(Arc::new(move |message: MessagePtr, session: SessionPtr| {
            handler(message, session).boxed()
        }))
    }

    pub fn is_session_aware(&self) -> bool {
        matches!(self, MessageListener::SessionAware(_))
    }
}

impl fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageListener::Plain(_) => f.write_str("MessageListener::Plain"),
            MessageListener::SessionAware(_) => f.write_str("MessageListener::SessionAware"),
        }
    }
}

/// Callback notified of every listener failure the container contains.
#[cfg_attr(test, mockall::automock)]
pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, error: &ContainerError);
}

/// Stock handlers used by the demo binary.
#[derive(Debug, Clone, Default)]
pub struct MessageHandlers;

impl MessageHandlers {
    /// Log every message and succeed.
    pub async fn logging_handler(message: MessagePtr) -> Result<()> {
        let start_time = Instant::now();

        debug!(
            "📬 Processing {} from {}: {}",
            message.message_id(),
            message.destination(),
            message.body_text().unwrap_or("<binary>")
        );

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        debug!(
            "✅ Message {} processed in {}ms",
            message.message_id(),
            start_time.elapsed().as_millis()
        );
        Ok(())
    }

    /// Fail for messages carrying `fail: true`, to exercise the failure path.
    pub async fn validating_handler(message: MessagePtr) -> Result<()> {
        if message.header("fail") == Some("true") {
            warn!("❌ Rejecting message {}", message.message_id());
            anyhow::bail!("message {} is marked as failing", message.message_id());
        }
        Self::logging_handler(message).await
    }

    pub fn logging_listener() -> MessageListener {
        MessageListener::plain(Self::logging_handler)
    }

    pub fn validating_listener() -> MessageListener {
        MessageListener::plain(Self::validating_handler)
    }
}

/// Exception listener that only logs.
#[derive(Debug, Clone, Default)]
pub struct LoggingExceptionListener;

impl ExceptionListener for LoggingExceptionListener {
    fn on_exception(&self, error: &ContainerError) {
        warn!("Listener failure reported: {}", error);
    }
}
