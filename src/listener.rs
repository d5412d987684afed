//! Listener invocation layer.
//!
//! Sits on top of the lifecycle core and knows how to turn a received message
//! into one listener call: destination resolution, consumer creation, the
//! commit / acknowledge policy and containment of listener failures.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::config::ContainerConfig;
use crate::destination::{Destination, DestinationResolver, DynamicDestinationResolver};
use crate::error::{ContainerError, Result};
use crate::handler::{ExceptionListener, MessageListener};
use crate::lifecycle::{close_quietly, ListeningContainer};
use crate::transport::{AckMode, ConnectionPtr, Consumer, MessagePtr, SessionPtr, TransportResult};

pub struct MessageListenerContainer {
    lifecycle: ListeningContainer,
    config: ContainerConfig,
    destination: Option<Destination>,
    resolved_destination: Mutex<Option<Destination>>,
    resolver: Arc<dyn DestinationResolver>,
    listener: Option<MessageListener>,
    exception_listener: Option<Arc<dyn ExceptionListener>>,
}

impl MessageListenerContainer {
    pub fn new(lifecycle: ListeningContainer, config: ContainerConfig) -> Self {
        Self {
            lifecycle,
            config,
            destination: None,
            resolved_destination: Mutex::new(None),
            resolver: Arc::new(DynamicDestinationResolver),
            listener: None,
            exception_listener: None,
        }
    }

    /// Use a destination handle instead of resolving the configured name.
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.config.destination = Some(destination.to_string());
        self.destination = Some(destination);
        self
    }

    pub fn with_listener(mut self, listener: MessageListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_exception_listener(mut self, exception_listener: Arc<dyn ExceptionListener>) -> Self {
        self.exception_listener = Some(exception_listener);
        self
    }

    pub fn lifecycle(&self) -> &ListeningContainer {
        &self.lifecycle
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.lifecycle.name()
    }

    pub fn message_listener(&self) -> Option<&MessageListener> {
        self.listener.as_ref()
    }

    /// Configured destination, for logging.
    pub fn destination_description(&self) -> String {
        match (&self.destination, &self.config.destination) {
            (Some(destination), _) => destination.to_string(),
            (None, Some(name)) => name.clone(),
            (None, None) => "<none>".to_string(),
        }
    }

    /// Reject configurations that can never receive.
    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.listener.is_none() {
            return Err(ContainerError::Config(format!(
                "container '{}' has no message listener",
                self.name()
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Destinations and consumers
    // ========================================================================

    /// Resolve the destination, caching the result of a by-name resolution.
    pub async fn resolve_destination(&self) -> TransportResult<Destination> {
        if let Some(destination) = &self.destination {
            return Ok(destination.clone());
        }
        if let Some(cached) = self.cached_destination() {
            return Ok(cached);
        }

        let name = self.config.destination.as_deref().unwrap_or_default();
        let destination = self
            .resolver
            .resolve(name, self.config.pub_sub_domain)
            .await?;
        *self
            .resolved_destination
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(destination.clone());
        Ok(destination)
    }

    fn cached_destination(&self) -> Option<Destination> {
        self.resolved_destination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget a cached by-name resolution so the next setup resolves again.
    pub fn refresh_destination(&self) {
        if self.destination.is_none() {
            let previous = self
                .resolved_destination
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(previous) = previous {
                debug!("[{}] Cleared cached destination {}", self.name(), previous);
            }
        }
    }

    pub async fn create_session(&self, connection: &ConnectionPtr) -> TransportResult<SessionPtr> {
        connection
            .create_session(self.config.session_transacted, self.config.ack_mode)
            .await
    }

    pub async fn create_listener_consumer(
        &self,
        session: &SessionPtr,
    ) -> TransportResult<Box<dyn Consumer>> {
        let destination = self.resolve_destination().await?;
        let no_local = destination.is_topic() && self.config.pub_sub_no_local;
        session
            .create_consumer(&destination, self.config.selector(), no_local)
            .await
    }

    /// Whether the container itself owns the transaction of `session`.
    ///
    /// `externally_bound` is set for a session synchronized with an external
    /// transaction manager, which then commits on the container's behalf.
    pub fn is_session_locally_transacted(&self, session: &SessionPtr, externally_bound: bool) -> bool {
        self.config.session_transacted && session.is_transacted() && !externally_bound
    }

    // ========================================================================
    // Listener execution
    // ========================================================================

    /// Run the listener for `message`, containing every failure.
    ///
    /// Returns `true` when the listener and the commit policy succeeded.
    pub async fn execute_listener(&self, session: &SessionPtr, message: MessagePtr) -> bool {
        match self.do_execute_listener(session, message, false).await {
            Ok(()) => true,
            Err(e) => {
                self.handle_listener_exception(&e);
                false
            }
        }
    }

    /// Run the listener and apply the commit or rollback policy.
    ///
    /// Errors are returned to the caller; a rollback failure replaces the
    /// listener error it was rolling back for.
    pub async fn do_execute_listener(
        &self,
        session: &SessionPtr,
        message: MessagePtr,
        externally_bound: bool,
    ) -> Result<()> {
        if !self.config.accept_messages_while_stopping && !self.lifecycle.is_running() {
            debug!(
                "[{}] Rejecting message {} received after the container stopped",
                self.name(),
                message.message_id()
            );
            self.rollback_if_necessary(session, externally_bound).await?;
            return Err(ContainerError::MessageRejected(message.message_id().to_string()));
        }

        if let Err(e) = self.invoke_listener(session, message.clone()).await {
            self.rollback_on_exception_if_necessary(session, externally_bound, &e)
                .await?;
            return Err(e);
        }

        self.commit_if_necessary(session, &message, externally_bound)
            .await
    }

    async fn invoke_listener(&self, session: &SessionPtr, message: MessagePtr) -> Result<()> {
        let listener = self.listener.as_ref().ok_or_else(|| {
            ContainerError::Config(format!("container '{}' has no message listener", self.name()))
        })?;

        match listener {
            MessageListener::Plain(handler) => {
                let handler = handler.clone();
                contain_panic(async move { handler(message).await }).await
            }
            MessageListener::SessionAware(handler) if self.config.expose_listener_session => {
                let handler = handler.clone();
                let session = session.clone();
                contain_panic(async move { handler(message, session).await }).await
            }
            MessageListener::SessionAware(handler) => {
                self.invoke_with_fresh_session(handler.clone(), message).await
            }
        }
    }

    /// Give a session-aware listener its own session on its own connection.
    async fn invoke_with_fresh_session(
        &self,
        handler: Arc<crate::handler::SessionAwareHandlerFn>,
        message: MessagePtr,
    ) -> Result<()> {
        let connection = self.lifecycle.create_connection().await?;
        let session = match self.create_session(&connection).await {
            Ok(session) => session,
            Err(e) => {
                close_quietly(&connection).await;
                return Err(e.into());
            }
        };

        let listener_session = session.clone();
        let mut result =
            contain_panic(async move { handler(message, listener_session).await }).await;

        if result.is_ok() && self.is_session_locally_transacted(&session, false) {
            result = session.commit().await.map_err(ContainerError::from);
        }

        if let Err(e) = session.close().await {
            debug!("[{}] Could not close listener session: {}", self.name(), e);
        }
        close_quietly(&connection).await;
        result
    }

    async fn commit_if_necessary(
        &self,
        session: &SessionPtr,
        message: &MessagePtr,
        externally_bound: bool,
    ) -> Result<()> {
        if session.is_transacted() {
            if self.is_session_locally_transacted(session, externally_bound) {
                session.commit().await?;
            }
        } else if session.acknowledge_mode() == AckMode::Client {
            message.acknowledge().await?;
        }
        Ok(())
    }

    async fn rollback_if_necessary(&self, session: &SessionPtr, externally_bound: bool) -> Result<()> {
        if session.is_transacted() && self.is_session_locally_transacted(session, externally_bound) {
            session.rollback().await?;
        }
        Ok(())
    }

    async fn rollback_on_exception_if_necessary(
        &self,
        session: &SessionPtr,
        externally_bound: bool,
        cause: &ContainerError,
    ) -> Result<()> {
        if session.is_transacted() && self.is_session_locally_transacted(session, externally_bound) {
            debug!("[{}] Rolling back transaction after listener failure", self.name());
            if let Err(e) = session.rollback().await {
                error!(
                    "[{}] Listener failure overridden by rollback failure: {}",
                    self.name(),
                    cause
                );
                return Err(e.into());
            }
        }
        Ok(())
    }

    // ========================================================================
    // Failure reporting
    // ========================================================================

    /// Report a contained failure: exception listener first, then the log.
    pub fn handle_listener_exception(&self, error: &ContainerError) {
        if let ContainerError::MessageRejected(_) = error {
            debug!("[{}] {}", self.name(), error);
            return;
        }

        self.invoke_exception_listener(error);

        if self.lifecycle.is_active() {
            warn!("[{}] Execution of message listener failed: {}", self.name(), error);
        } else {
            debug!("[{}] Listener failure after container shutdown: {}", self.name(), error);
        }
    }

    pub fn invoke_exception_listener(&self, error: &ContainerError) {
        if let Some(exception_listener) = &self.exception_listener {
            exception_listener.on_exception(error);
        }
    }
}

/// Await a listener future, turning its error or panic into a listener failure.
async fn contain_panic<F>(future: F) -> Result<()>
where
    F: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ContainerError::Listener(e)),
        Err(payload) => Err(ContainerError::ListenerPanicked(panic_message(&*payload))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
