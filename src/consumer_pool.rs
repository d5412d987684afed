//! Concurrent polling engine.
//!
//! A [`DefaultListenerContainer`] runs `concurrent_consumers` invokers, each
//! one a task looping `receive -> execute -> commit/rollback` against the
//! configured destination. Invokers cache broker resources according to the
//! [`CacheLevel`] and recover from setup failures through a shared recovery
//! epoch, so that only one invoker refreshes the connection per failure.
//!
//! ```text
//! INIT_RESOURCES -> RECEIVE -> EXECUTE -> loop
//!        \______________\_________\____ failure -> CLEAR -> RECOVER -> RESCHEDULE | EXIT
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::{CacheLevel, ContainerConfig};
use crate::destination::{Destination, DestinationResolver};
use crate::error::{ContainerError, Result};
use crate::executor::{ScheduledTask, TaskExecutor, TokioTaskExecutor};
use crate::handler::{ExceptionListener, MessageListener};
use crate::lifecycle::{
    close_quietly, LifecycleHooks, LifecycleSettings, LifecycleState, ListeningContainer,
};
use crate::listener::MessageListenerContainer;
use crate::transaction::{self, TransactionManager, TransactionStatus};
use crate::transport::{
    AckMode, ConnectionFactoryPtr, ConnectionPtr, Consumer, MessagePtr, SessionPtr,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct InvokerCounts {
    scheduled: usize,
    active: usize,
}

struct PollingContainer {
    base: MessageListenerContainer,
    cache_level: CacheLevel,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    counts: watch::Sender<InvokerCounts>,
    /// Current recovery epoch; held for the whole recovery
    recovery_monitor: Mutex<u64>,
    current_epoch: AtomicU64,
    self_ref: Weak<PollingContainer>,
}

/// Message listener container backed by a pool of polling invokers.
///
/// Cheap to clone; clones drive the same container.
#[derive(Clone)]
pub struct DefaultListenerContainer {
    inner: Arc<PollingContainer>,
}

impl DefaultListenerContainer {
    pub fn builder(connection_factory: ConnectionFactoryPtr) -> ContainerBuilder {
        ContainerBuilder::new(connection_factory)
    }

    /// Validate the configuration, activate the container and schedule the
    /// invokers. Starts receiving right away when auto-startup is set.
    ///
    /// Must only be called once.
    pub async fn initialize(&self) -> Result<()> {
        let inner = &self.inner;
        inner.base.validate()?;

        if inner.transaction_manager.is_some() && inner.cache_level > CacheLevel::Connection {
            debug!(
                "[{}] Caching {} level resources with an external transaction manager",
                self.name(),
                inner.cache_level
            );
        }

        info!(
            "🏊 Initializing listener container '{}' for {} (consumers: {}, cache: {})",
            self.name(),
            inner.base.destination_description(),
            inner.base.config().concurrent_consumers,
            inner.cache_level
        );
        inner.base.lifecycle().initialize(inner.as_ref()).await
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.base.lifecycle().start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.inner.base.lifecycle().stop().await
    }

    /// Stop receiving, wait for every invoker to exit and close the shared
    /// connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.base.lifecycle().shutdown(self.inner.as_ref()).await
    }

    pub fn name(&self) -> &str {
        self.inner.base.name()
    }

    pub fn destination_description(&self) -> String {
        self.inner.base.destination_description()
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.base.lifecycle().state()
    }

    pub fn is_active(&self) -> bool {
        self.inner.base.lifecycle().is_active()
    }

    pub fn is_running(&self) -> bool {
        self.inner.base.lifecycle().is_running()
    }

    pub fn cache_level(&self) -> CacheLevel {
        self.inner.cache_level
    }

    /// Invokers currently inside their receive loop.
    pub fn active_consumer_count(&self) -> usize {
        self.inner.counts.borrow().active
    }

    /// Invokers that exist, whether running, parked or queued on the executor.
    pub fn scheduled_consumer_count(&self) -> usize {
        self.inner.counts.borrow().scheduled
    }

    pub fn paused_task_count(&self) -> usize {
        self.inner.base.lifecycle().paused_task_count()
    }

    /// Number of completed recoveries.
    pub fn recovery_epoch(&self) -> u64 {
        self.inner.current_epoch.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LifecycleHooks for PollingContainer {
    async fn do_initialize(&self) -> Result<()> {
        for _ in 0..self.base.config().concurrent_consumers {
            self.schedule_new_invoker()?;
        }
        Ok(())
    }

    async fn do_shutdown(&self) -> Result<()> {
        debug!("[{}] Waiting for shutdown of message listener invokers", self.base.name());
        let mut rx = self.counts.subscribe();
        // The sender lives in `self`, so this only ends once the condition holds
        let _ = rx
            .wait_for(|counts| counts.active == 0 && counts.scheduled == 0)
            .await;
        debug!("[{}] All message listener invokers exited", self.base.name());
        Ok(())
    }
}

impl PollingContainer {
    fn schedule_new_invoker(&self) -> Result<()> {
        let container = self.self_ref.upgrade().ok_or_else(|| {
            ContainerError::IllegalState("listener container was dropped".to_string())
        })?;
        let invoker = AsyncMessageListenerInvoker::new(container);
        debug!("🔄 [{}] Scheduling invoker {}", self.base.name(), invoker.id);
        self.base.lifecycle().task_executor().execute(invoker.into_task());
        Ok(())
    }

    fn lifecycle(&self) -> &ListeningContainer {
        self.base.lifecycle()
    }

    fn recovery_interval(&self) -> Duration {
        self.base.config().recovery_interval()
    }

    /// Log a setup failure and report it to the exception listener.
    fn handle_listener_setup_failure(
        &self,
        invoker_id: &str,
        error: &ContainerError,
        already_recovered: bool,
    ) {
        if let ContainerError::SharedConnectionNotInitialized = error {
            if !already_recovered {
                debug!("[{}] Invoker needs to establish the shared connection", invoker_id);
            }
            return;
        }

        self.base.invoke_exception_listener(error);

        if already_recovered {
            debug!(
                "[{}] Setup of invoker failed, already recovered by another invoker: {}",
                invoker_id, error
            );
        } else {
            warn!(
                "[{}] Setup of invoker failed for destination '{}', trying to recover: {}",
                invoker_id,
                self.base.destination_description(),
                error
            );
        }
    }

    /// Returns `false` when shutdown cut the recovery short.
    async fn recover_after_listener_setup_failure(&self) -> bool {
        if !self.refresh_connection_until_successful().await {
            return false;
        }
        self.base.refresh_destination();
        true
    }

    /// Keep replacing the connection until it works or the container is no
    /// longer active.
    ///
    /// Returns `true` once a connection was refreshed.
    async fn refresh_connection_until_successful(&self) -> bool {
        let lifecycle = self.lifecycle();
        while lifecycle.is_active() {
            let attempt = if lifecycle.is_shared_connection_enabled() {
                lifecycle.refresh_shared_connection().await.map(|_| ())
            } else {
                match lifecycle.create_connection().await {
                    Ok(connection) => {
                        close_quietly(&connection).await;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            };

            match attempt {
                Ok(()) => {
                    info!("🔌 [{}] Successfully refreshed connection", self.base.name());
                    return true;
                }
                Err(e) => {
                    error!(
                        "[{}] Could not refresh connection for destination '{}', retrying in {}ms: {}",
                        self.base.name(),
                        self.base.destination_description(),
                        self.recovery_interval().as_millis(),
                        e
                    );
                }
            }

            if !lifecycle.sleep_interruptibly(self.recovery_interval()).await {
                break;
            }
        }
        false
    }

    fn update_counts(&self, update: impl FnOnce(&mut InvokerCounts)) {
        self.counts.send_modify(update);
    }
}

/// Keeps the active invoker count honest, even if an invoker task unwinds.
struct ActiveInvokerGuard {
    container: Arc<PollingContainer>,
    counted: bool,
}

impl ActiveInvokerGuard {
    fn new(container: Arc<PollingContainer>) -> Self {
        container.update_counts(|counts| counts.active += 1);
        Self {
            container,
            counted: true,
        }
    }

    /// Waiting invokers do not count as active.
    fn suspend(&mut self) {
        if self.counted {
            self.counted = false;
            self.container.update_counts(|counts| counts.active -= 1);
        }
    }

    fn resume(&mut self) {
        if !self.counted {
            self.counted = true;
            self.container.update_counts(|counts| counts.active += 1);
        }
    }
}

impl Drop for ActiveInvokerGuard {
    fn drop(&mut self) {
        self.suspend();
    }
}

/// Per-iteration resources, closed once the iteration ends.
#[derive(Default)]
struct TransientResources {
    connection: Option<ConnectionPtr>,
    session: Option<SessionPtr>,
    consumer: Option<Box<dyn Consumer>>,
}

impl TransientResources {
    async fn close(mut self, invoker_id: &str) {
        if let Some(mut consumer) = self.consumer.take() {
            if let Err(e) = consumer.close().await {
                debug!("[{}] Could not close consumer: {}", invoker_id, e);
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!("[{}] Could not close session: {}", invoker_id, e);
            }
        }
        if let Some(connection) = self.connection.take() {
            close_quietly(&connection).await;
        }
    }
}

/// One concurrency slot. Moves from task to task when rescheduled.
struct AsyncMessageListenerInvoker {
    id: String,
    container: Arc<PollingContainer>,
    session: Option<SessionPtr>,
    consumer: Option<Box<dyn Consumer>>,
    last_recovery_marker: u64,
    /// `false` until the first iteration completes, and again after a failure
    last_message_succeeded: bool,
}

impl AsyncMessageListenerInvoker {
    fn new(container: Arc<PollingContainer>) -> Self {
        container.update_counts(|counts| counts.scheduled += 1);
        Self {
            id: format!("{}#{}", container.base.name(), Uuid::new_v4()),
            container,
            session: None,
            consumer: None,
            last_recovery_marker: 0,
            last_message_succeeded: false,
        }
    }

    fn into_task(self) -> ScheduledTask {
        self.run_and_reschedule().boxed()
    }

    async fn run_and_reschedule(mut self) {
        let container = self.container.clone();
        let mut active = ActiveInvokerGuard::new(container.clone());

        if let Err(e) = self.run(&mut active).await {
            self.recover_from(e).await;
        }
        drop(active);

        let lifecycle = container.lifecycle();
        if !lifecycle.is_active() {
            debug!("✅ [{}] Invoker exiting", self.id);
            self.clear_resources().await;
            return;
        }

        let id = self.id.clone();
        if !lifecycle.reschedule_task_if_necessary(self.into_task()) {
            // Dropping the invoker closes its resources
            debug!("[{}] Container shut down while rescheduling, invoker dropped", id);
        }
    }

    async fn run(&mut self, active: &mut ActiveInvokerGuard) -> Result<bool> {
        let container = self.container.clone();
        match container.base.config().message_quota() {
            None => self.execute_ongoing_loop(active).await,
            Some(quota) => {
                let mut message_received = false;
                let mut attempts = 0;
                while container.lifecycle().is_running() && attempts < quota {
                    message_received |= self.invoke_listener().await?;
                    attempts += 1;
                }
                Ok(message_received)
            }
        }
    }

    async fn execute_ongoing_loop(&mut self, active: &mut ActiveInvokerGuard) -> Result<bool> {
        let container = self.container.clone();
        let lifecycle = container.lifecycle();
        let mut message_received = false;

        loop {
            if !lifecycle.is_running() {
                active.suspend();
                let running = lifecycle.wait_while_not_running().await;
                active.resume();
                if !running {
                    break;
                }
            }
            message_received |= self.invoke_listener().await?;
        }
        Ok(message_received)
    }

    async fn invoke_listener(&mut self) -> Result<bool> {
        self.init_resources_if_necessary().await?;
        let message_received = self.receive_and_execute().await?;
        self.last_message_succeeded = true;
        Ok(message_received)
    }

    async fn init_resources_if_necessary(&mut self) -> Result<()> {
        let container = self.container.clone();
        if !container.cache_level.caches_session() {
            self.update_recovery_marker().await;
            return Ok(());
        }

        if self.session.is_none() {
            self.update_recovery_marker().await;
            let connection = container.lifecycle().shared_connection().await?;
            self.session = Some(container.base.create_session(&connection).await?);
        }
        if self.consumer.is_none() && container.cache_level.caches_consumer() {
            if let Some(session) = self.session.clone() {
                self.consumer = Some(container.base.create_listener_consumer(&session).await?);
                debug!("[{}] Consumer registered", self.id);
            }
        }
        Ok(())
    }

    async fn update_recovery_marker(&mut self) {
        // Through the lock, not `current_epoch`: a recovery in progress must finish first
        self.last_recovery_marker = *self.container.recovery_monitor.lock().await;
    }

    async fn receive_and_execute(&mut self) -> Result<bool> {
        let container = self.container.clone();
        let Some(manager) = container.transaction_manager.as_ref() else {
            return self.do_receive_and_execute(None).await;
        };

        let status = manager
            .begin(container.base.config().transaction_timeout())
            .await?;
        match self.do_receive_and_execute(Some(&status)).await {
            Ok(message_received) => {
                transaction::complete(manager.as_ref(), &status).await?;
                Ok(message_received)
            }
            Err(e) => {
                if let Err(rollback_error) = manager.rollback(&status).await {
                    error!(
                        "[{}] Failure overridden by transaction rollback failure: {}",
                        self.id, e
                    );
                    return Err(rollback_error.into());
                }
                Err(e)
            }
        }
    }

    async fn do_receive_and_execute(&mut self, status: Option<&TransactionStatus>) -> Result<bool> {
        let mut transient = TransientResources::default();
        let result = self.receive_with(status, &mut transient).await;
        transient.close(&self.id).await;
        result
    }

    async fn receive_with(
        &mut self,
        status: Option<&TransactionStatus>,
        transient: &mut TransientResources,
    ) -> Result<bool> {
        let container = self.container.clone();
        let base = &container.base;
        let lifecycle = base.lifecycle();

        let mut externally_bound = false;
        let session = match &self.session {
            Some(session) => session.clone(),
            None => {
                let bound = match (status, container.transaction_manager.as_ref()) {
                    (Some(status), Some(manager)) => manager.transactional_session(status).await?,
                    _ => None,
                };
                match bound {
                    Some(session) => {
                        externally_bound = true;
                        session
                    }
                    None => {
                        let connection = if lifecycle.is_shared_connection_enabled() {
                            lifecycle.shared_connection().await?
                        } else {
                            let connection = lifecycle.create_connection().await?;
                            transient.connection = Some(connection.clone());
                            connection.start().await?;
                            connection
                        };
                        let session = base.create_session(&connection).await?;
                        transient.session = Some(session.clone());
                        session
                    }
                }
            }
        };

        let consumer = match self.consumer.as_mut() {
            Some(consumer) => consumer,
            None => transient
                .consumer
                .insert(base.create_listener_consumer(&session).await?),
        };

        let received = tokio::select! {
            received = consumer.receive(base.config().receive_timeout()) => received?,
            _ = lifecycle.shutdown_requested() => None,
        };
        let Some(message) = received else {
            return Ok(false);
        };

        trace!("[{}] Received message {}", self.id, message.message_id());
        if let Err(e) = base.do_execute_listener(&session, message, externally_bound).await {
            if let Some(status) = status {
                status.set_rollback_only();
            }
            base.handle_listener_exception(&e);
            if e.is_setup_failure() {
                return Err(e);
            }
        }
        Ok(true)
    }

    /// Clear resources, back off, then recover unless another invoker already did.
    async fn recover_from(&mut self, error: ContainerError) {
        let container = self.container.clone();
        let lifecycle = container.lifecycle();
        self.clear_resources().await;

        if !lifecycle.is_active() {
            debug!("[{}] Invoker failed after shutdown began: {}", self.id, error);
            return;
        }

        // Failed twice in a row, or before ever succeeding
        if !self.last_message_succeeded
            && !lifecycle
                .sleep_interruptibly(container.recovery_interval())
                .await
        {
            debug!("[{}] Recovery back-off interrupted by shutdown: {}", self.id, error);
            return;
        }
        self.last_message_succeeded = false;

        let mut epoch = container.recovery_monitor.lock().await;
        if !lifecycle.is_active() {
            debug!("[{}] Invoker failed after shutdown began: {}", self.id, error);
            return;
        }
        if self.last_recovery_marker != *epoch {
            drop(epoch);
            container.handle_listener_setup_failure(&self.id, &error, true);
            return;
        }

        container.handle_listener_setup_failure(&self.id, &error, false);
        if container.recover_after_listener_setup_failure().await {
            *epoch += 1;
            container.current_epoch.store(*epoch, Ordering::SeqCst);
        } else {
            debug!("[{}] Recovery abandoned, container is shutting down", self.id);
        }
    }

    async fn clear_resources(&mut self) {
        close_resources(&self.id, self.consumer.take(), self.session.take()).await;
    }
}

async fn close_resources(
    invoker_id: &str,
    consumer: Option<Box<dyn Consumer>>,
    session: Option<SessionPtr>,
) {
    if let Some(mut consumer) = consumer {
        if let Err(e) = consumer.close().await {
            debug!("[{}] Could not close consumer: {}", invoker_id, e);
        }
    }
    if let Some(session) = session {
        if let Err(e) = session.close().await {
            debug!("[{}] Could not close session: {}", invoker_id, e);
        }
    }
}

impl Drop for AsyncMessageListenerInvoker {
    /// Invokers discarded while parked, or refused a reschedule, still own
    /// their cached resources. They are closed on a cleanup task and the
    /// invoker only stops counting as scheduled once that is done, so
    /// shutdown waits for it.
    fn drop(&mut self) {
        let consumer = self.consumer.take();
        let session = self.session.take();
        let container = self.container.clone();

        if consumer.is_none() && session.is_none() {
            container.update_counts(|counts| counts.scheduled -= 1);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let id = std::mem::take(&mut self.id);
                handle.spawn(async move {
                    debug!("[{}] Closing resources of discarded invoker", id);
                    close_resources(&id, consumer, session).await;
                    container.update_counts(|counts| counts.scheduled -= 1);
                });
            }
            Err(_) => {
                debug!("[{}] No runtime to close resources of discarded invoker", self.id);
                container.update_counts(|counts| counts.scheduled -= 1);
            }
        }
    }
}

/// Builder for [`DefaultListenerContainer`].
pub struct ContainerBuilder {
    connection_factory: ConnectionFactoryPtr,
    config: ContainerConfig,
    destination: Option<Destination>,
    listener: Option<MessageListener>,
    transaction_manager: Option<Arc<dyn TransactionManager>>,
    exception_listener: Option<Arc<dyn ExceptionListener>>,
    resolver: Option<Arc<dyn DestinationResolver>>,
    task_executor: Arc<dyn TaskExecutor>,
}

impl ContainerBuilder {
    pub fn new(connection_factory: ConnectionFactoryPtr) -> Self {
        Self {
            connection_factory,
            config: ContainerConfig::default(),
            destination: None,
            listener: None,
            transaction_manager: None,
            exception_listener: None,
            resolver: None,
            task_executor: Arc::new(TokioTaskExecutor),
        }
    }

    /// Replace every plain setting at once.
    pub fn config(mut self, config: ContainerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.config.name = name.to_string();
        self
    }

    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn destination_name(mut self, name: &str) -> Self {
        self.config.destination = Some(name.to_string());
        self
    }

    pub fn pub_sub_domain(mut self, pub_sub_domain: bool) -> Self {
        self.config.pub_sub_domain = pub_sub_domain;
        self
    }

    pub fn message_selector(mut self, selector: &str) -> Self {
        self.config.message_selector = Some(selector.to_string());
        self
    }

    pub fn pub_sub_no_local(mut self, no_local: bool) -> Self {
        self.config.pub_sub_no_local = no_local;
        self
    }

    pub fn client_id(mut self, client_id: &str) -> Self {
        self.config.client_id = Some(client_id.to_string());
        self
    }

    pub fn message_listener(mut self, listener: MessageListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Register a plain `handler(message)` listener.
    pub fn listener<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(MessagePtr) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.message_listener(MessageListener::plain(handler))
    }

    /// Register a `handler(message, session)` listener.
    pub fn session_aware_listener<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(MessagePtr, SessionPtr) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.message_listener(MessageListener::session_aware(handler))
    }

    pub fn concurrent_consumers(mut self, consumers: u32) -> Self {
        self.config.concurrent_consumers = consumers;
        self
    }

    pub fn max_messages_per_task(mut self, max_messages: i32) -> Self {
        self.config.max_messages_per_task = max_messages;
        self
    }

    pub fn cache_level(mut self, level: CacheLevel) -> Self {
        self.config.cache_level = Some(level);
        self
    }

    /// Set the cache level from its integer code, NONE=0 through CONSUMER=3.
    pub fn cache_level_code(self, code: i32) -> Result<Self> {
        let level = CacheLevel::try_from(code)?;
        Ok(self.cache_level(level))
    }

    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = Some(manager);
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.transaction_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.config.receive_timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn recovery_interval(mut self, interval: Duration) -> Self {
        self.config.recovery_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn session_transacted(mut self, transacted: bool) -> Self {
        self.config.session_transacted = transacted;
        self
    }

    pub fn ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.config.ack_mode = ack_mode;
        self
    }

    pub fn auto_startup(mut self, auto_startup: bool) -> Self {
        self.config.auto_startup = auto_startup;
        self
    }

    pub fn accept_messages_while_stopping(mut self, accept: bool) -> Self {
        self.config.accept_messages_while_stopping = accept;
        self
    }

    pub fn expose_listener_session(mut self, expose: bool) -> Self {
        self.config.expose_listener_session = expose;
        self
    }

    pub fn exception_listener(mut self, listener: Arc<dyn ExceptionListener>) -> Self {
        self.exception_listener = Some(listener);
        self
    }

    pub fn destination_resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn task_executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.task_executor = executor;
        self
    }

    /// Assemble the container. Configuration is validated by `initialize`.
    pub fn build(self) -> DefaultListenerContainer {
        let cache_level = self
            .config
            .effective_cache_level(self.transaction_manager.is_some());

        let lifecycle = ListeningContainer::new(
            LifecycleSettings {
                name: self.config.name.clone(),
                client_id: self.config.client_id.clone(),
                auto_startup: self.config.auto_startup,
                shared_connection_enabled: cache_level.caches_connection(),
            },
            self.connection_factory,
            self.task_executor,
        );

        let mut base = MessageListenerContainer::new(lifecycle, self.config);
        if let Some(destination) = self.destination {
            base = base.with_destination(destination);
        }
        if let Some(listener) = self.listener {
            base = base.with_listener(listener);
        }
        if let Some(resolver) = self.resolver {
            base = base.with_resolver(resolver);
        }
        if let Some(exception_listener) = self.exception_listener {
            base = base.with_exception_listener(exception_listener);
        }

        let transaction_manager = self.transaction_manager;
        let (counts, _) = watch::channel(InvokerCounts::default());
        let inner = Arc::new_cyclic(|self_ref| PollingContainer {
            base,
            cache_level,
            transaction_manager,
            counts,
            recovery_monitor: Mutex::new(0),
            current_epoch: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        });

        DefaultListenerContainer { inner }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the polling engine, run against the in-memory broker.
    //!
    //! ### Coverage
    //! - Steady-state consumption with several invokers
    //! - Exactly one recoverer per failure episode
    //! - Listener failures never trigger recovery
    //! - Commit / rollback once per delivery
    //! - Recovery back-off during a persistent outage
    //! - Stop / start with parked tasks in short-task mode
    //! - Shutdown draining in-flight work
    //! - External transaction manager wrapping

    use super::*;
    use crate::memory::MemoryBroker;
    use crate::transport::TransportResult;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    // ========================================================================
    // TEST HELPERS
    // ========================================================================

    fn create_test_builder(broker: &MemoryBroker) -> ContainerBuilder {
        DefaultListenerContainer::builder(broker.connection_factory())
            .name("orders-container")
            .destination_name("orders")
            .receive_timeout(Duration::from_millis(20))
            .recovery_interval(Duration::from_millis(50))
    }

    fn counting_listener(calls: Arc<AtomicUsize>) -> MessageListener {
        MessageListener::plain(move |_message| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    /// Poll `condition` every 10ms until it holds or `timeout` elapses.
    async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    fn send_orders(broker: &MemoryBroker, count: usize) {
        let orders = Destination::queue("orders");
        for i in 0..count {
            broker.send_text(&orders, &format!("order-{}", i));
        }
    }

    // ========================================================================
    // STEADY STATE
    // ========================================================================

    #[tokio::test]
    async fn test_concurrent_invokers_consume_everything() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let container = create_test_builder(&broker)
            .concurrent_consumers(3)
            .message_listener(counting_listener(calls.clone()))
            .build();

        container.initialize().await.unwrap();
        assert!(container.is_running());
        assert_eq!(container.cache_level(), CacheLevel::Consumer);

        send_orders(&broker, 20);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 20).await);
        assert!(wait_until(Duration::from_secs(1), || container.active_consumer_count() == 3).await);
        assert_eq!(container.scheduled_consumer_count(), 3);

        let stats = broker.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.sessions_created, 3);
        assert_eq!(stats.consumers_created, 3);
        assert_eq!(container.recovery_epoch(), 0);

        container.shutdown().await.unwrap();
        assert_eq!(container.active_consumer_count(), 0);
        assert_eq!(container.scheduled_consumer_count(), 0);
        assert_eq!(container.state(), LifecycleState::Shutdown);
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_configuration() {
        let broker = MemoryBroker::new();

        let no_listener = create_test_builder(&broker).build();
        assert!(matches!(no_listener.initialize().await, Err(ContainerError::Config(_))));

        let no_consumers = create_test_builder(&broker)
            .concurrent_consumers(0)
            .listener(|_message| async { Ok(()) })
            .build();
        assert!(matches!(no_consumers.initialize().await, Err(ContainerError::Config(_))));

        let no_destination = DefaultListenerContainer::builder(broker.connection_factory())
            .listener(|_message| async { Ok(()) })
            .build();
        assert!(matches!(no_destination.initialize().await, Err(ContainerError::Config(_))));

        assert!(create_test_builder(&broker).cache_level_code(7).is_err());
        assert_eq!(broker.stats().connection_attempts, 0);
    }

    #[tokio::test]
    async fn test_cache_level_none_uses_fresh_resources() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let container = create_test_builder(&broker)
            .cache_level_code(0)
            .unwrap()
            .message_listener(counting_listener(calls.clone()))
            .build();

        container.initialize().await.unwrap();
        send_orders(&broker, 3);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 3).await);
        container.shutdown().await.unwrap();

        // One connection, session and consumer per receive iteration
        let stats = broker.stats();
        assert!(stats.connections_created >= 3);
        assert_eq!(stats.connections_created, stats.sessions_created);
        assert_eq!(stats.sessions_created, stats.consumers_created);
    }

    #[tokio::test]
    async fn test_cache_level_session_recreates_consumers() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let container = create_test_builder(&broker)
            .cache_level(CacheLevel::Session)
            .message_listener(counting_listener(calls.clone()))
            .build();

        container.initialize().await.unwrap();
        send_orders(&broker, 3);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 3).await);
        container.shutdown().await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.sessions_created, 1);
        assert!(stats.consumers_created >= 3);
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    #[tokio::test]
    async fn test_exactly_one_recoverer_when_consumers_fail() {
        let broker = MemoryBroker::new();
        broker.fail_next_consumers(2);
        let calls = Arc::new(AtomicUsize::new(0));
        let container = create_test_builder(&broker)
            .concurrent_consumers(3)
            .message_listener(counting_listener(calls.clone()))
            .build();

        let started = Instant::now();
        container.initialize().await.unwrap();

        assert!(wait_until(Duration::from_secs(2), || container.recovery_epoch() == 1).await);
        assert!(wait_until(Duration::from_secs(2), || container.active_consumer_count() == 3).await);

        send_orders(&broker, 9);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 9).await);
        assert!(started.elapsed() >= Duration::from_millis(50));

        // Initial shared connection plus a single refresh
        assert_eq!(broker.stats().connections_created, 2);
        assert_eq!(container.recovery_epoch(), 1);

        container.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_failures_never_trigger_recovery() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let container = create_test_builder(&broker)
            .concurrent_consumers(2)
            .listener(move |_message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("always failing"))
                }
            })
            .build();

        container.initialize().await.unwrap();
        send_orders(&broker, 6);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 6).await);

        let stats = broker.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.sessions_created, 2);
        assert_eq!(stats.consumers_created, 2);
        assert_eq!(container.recovery_epoch(), 0);

        container.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recovers_after_broker_restart() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let container = create_test_builder(&broker)
            .concurrent_consumers(2)
            .message_listener(counting_listener(calls.clone()))
            .build();

        container.initialize().await.unwrap();
        send_orders(&broker, 2);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 2).await);

        broker.break_connections();
        assert!(wait_until(Duration::from_secs(2), || container.recovery_epoch() == 1).await);

        send_orders(&broker, 4);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 6).await);
        assert_eq!(broker.stats().connections_created, 2);

        container.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_outage_backs_off() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let container = create_test_builder(&broker)
            .concurrent_consumers(3)
            .message_listener(counting_listener(calls.clone()))
            .build();

        container.initialize().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || container.active_consumer_count() == 3).await);
        let before = broker.stats().connection_attempts;

        broker.fail_next_connections(u32::MAX);
        broker.break_connections();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // One refresh attempt per recovery interval, not one per invoker spin
        let attempts = broker.stats().connection_attempts - before;
        assert!(attempts >= 2, "expected retries, got {}", attempts);
        assert!(attempts <= 15, "expected back-off, got {} attempts", attempts);

        broker.fail_next_connections(0);
        send_orders(&broker, 3);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 3).await);

        container.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_setup_failure_reaches_exception_listener() {
        use crate::handler::MockExceptionListener;

        let broker = MemoryBroker::new();
        broker.fail_next_consumers(1);
        let mut exception_listener = MockExceptionListener::new();
        exception_listener
            .expect_on_exception()
            .withf(|e| e.is_setup_failure())
            .times(1)
            .return_const(());

        let container = create_test_builder(&broker)
            .listener(|_message| async { Ok(()) })
            .exception_listener(Arc::new(exception_listener))
            .build();

        container.initialize().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || container.recovery_epoch() == 1).await);
        container.shutdown().await.unwrap();
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    #[tokio::test]
    async fn test_commit_or_rollback_once_per_delivery() {
        let broker = MemoryBroker::new();
        let orders = Destination::queue("orders");
        let fail_once = HashMap::from([("fail".to_string(), "once".to_string())]);
        broker.send_text(&orders, "good-1");
        broker.send(&orders, "flaky-1", fail_once.clone());
        broker.send_text(&orders, "good-2");
        broker.send(&orders, "flaky-2", fail_once);

        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let container = create_test_builder(&broker)
            .session_transacted(true)
            .listener(move |message| {
                let counter = counter.clone();
                async move {
                    if message.header("fail") == Some("once") && !message.redelivered() {
                        anyhow::bail!("first delivery of {} fails", message.message_id());
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();

        container.initialize().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || done.load(Ordering::SeqCst) == 4).await);
        container.shutdown().await.unwrap();

        let stats = broker.stats();
        assert_eq!(stats.delivered, 6);
        assert_eq!(stats.commits, 4);
        assert_eq!(stats.rollbacks, 2);
        assert_eq!(stats.commits + stats.rollbacks, stats.delivered);
        assert_eq!(broker.queue_depth("orders"), 0);
    }

    #[derive(Default)]
    struct RecordingTransactionManager {
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl TransactionManager for RecordingTransactionManager {
        async fn begin(&self, timeout: Option<Duration>) -> TransportResult<TransactionStatus> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(TransactionStatus::new(timeout))
        }

        async fn commit(&self, _status: &TransactionStatus) -> TransportResult<()> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _status: &TransactionStatus) -> TransportResult<()> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_transaction_manager_wraps_each_iteration() {
        let broker = MemoryBroker::new();
        let orders = Destination::queue("orders");
        broker.send_text(&orders, "good");
        broker.send(
            &orders,
            "bad",
            HashMap::from([("fail".to_string(), "true".to_string())]),
        );

        let manager = Arc::new(RecordingTransactionManager::default());
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let container = create_test_builder(&broker)
            .transaction_manager(manager.clone())
            .transaction_timeout(Duration::from_secs(30))
            .listener(move |message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if message.header("fail") == Some("true") {
                        anyhow::bail!("rejecting {}", message.message_id());
                    }
                    Ok(())
                }
            })
            .build();

        // Unset cache level falls back to none with a transaction manager
        assert_eq!(container.cache_level(), CacheLevel::None);

        container.initialize().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || handled.load(Ordering::SeqCst) == 2).await);
        container.shutdown().await.unwrap();

        let begins = manager.begins.load(Ordering::SeqCst);
        let commits = manager.commits.load(Ordering::SeqCst);
        let rollbacks = manager.rollbacks.load(Ordering::SeqCst);
        assert_eq!(rollbacks, 1);
        assert_eq!(begins, commits + rollbacks);
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    #[tokio::test]
    async fn test_stop_parks_short_tasks_and_start_resumes_them_once() {
        let broker = MemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let container = create_test_builder(&broker)
            .concurrent_consumers(3)
            .max_messages_per_task(1)
            .message_listener(counting_listener(calls.clone()))
            .build();

        container.initialize().await.unwrap();
        container.stop().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || container.paused_task_count() == 3).await);
        assert_eq!(container.scheduled_consumer_count(), 3);
        assert_eq!(container.active_consumer_count(), 0);

        container.start().await.unwrap();
        assert_eq!(container.paused_task_count(), 0);
        assert_eq!(container.scheduled_consumer_count(), 3);

        send_orders(&broker, 6);
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 6).await);
        assert_eq!(container.scheduled_consumer_count(), 3);

        container.shutdown().await.unwrap();
        assert_eq!(container.scheduled_consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_startup_disabled_waits_for_start() {
        let broker = MemoryBroker::new();
        send_orders(&broker, 2);
        let calls = Arc::new(AtomicUsize::new(0));
        let container = create_test_builder(&broker)
            .auto_startup(false)
            .message_listener(counting_listener(calls.clone()))
            .build();

        container.initialize().await.unwrap();
        assert_eq!(container.state(), LifecycleState::Stopped);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(container.active_consumer_count(), 0);

        container.start().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 2).await);

        container.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_listener() {
        let broker = MemoryBroker::new();
        let started = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        let (started_flag, finished_flag) = (started.clone(), finished.clone());
        let container = create_test_builder(&broker)
            .accept_messages_while_stopping(true)
            .listener(move |_message| {
                let started = started_flag.clone();
                let finished = finished_flag.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build();

        container.initialize().await.unwrap();
        send_orders(&broker, 1);
        assert!(wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst) == 1).await);

        let shutdown_started = Instant::now();
        container.shutdown().await.unwrap();

        assert!(shutdown_started.elapsed() >= Duration::from_millis(100));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(container.active_consumer_count(), 0);
        assert_eq!(container.scheduled_consumer_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocking_receive() {
        let broker = MemoryBroker::new();
        let container = create_test_builder(&broker)
            .receive_timeout(Duration::ZERO)
            .listener(|_message| async { Ok(()) })
            .build();

        container.initialize().await.unwrap();
        assert!(wait_until(Duration::from_secs(1), || container.active_consumer_count() == 1).await);

        tokio::time::timeout(Duration::from_secs(1), container.shutdown())
            .await
            .expect("shutdown should not wait for an indefinite receive")
            .unwrap();
    }

    /// Exception listener that keeps a debug rendering of every report.
    #[derive(Default)]
    struct RecordingExceptionListener {
        reports: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingExceptionListener {
        fn reports(&self) -> Vec<String> {
            self.reports.lock().unwrap().clone()
        }
    }

    impl ExceptionListener for RecordingExceptionListener {
        fn on_exception(&self, error: &ContainerError) {
            self.reports.lock().unwrap().push(format!("{:?}", error));
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_recovery_sleep() {
        let broker = MemoryBroker::new();
        broker.fail_next_consumers(u32::MAX);
        let exception_listener = Arc::new(RecordingExceptionListener::default());
        let container = create_test_builder(&broker)
            .recovery_interval(Duration::from_secs(30))
            .listener(|_message| async { Ok(()) })
            .exception_listener(exception_listener.clone())
            .build();

        container.initialize().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(1), container.shutdown())
            .await
            .expect("recovery sleep should be interrupted")
            .unwrap();
        assert_eq!(container.scheduled_consumer_count(), 0);

        // Interrupted back-off is not a recovery and not a reportable failure
        assert_eq!(container.recovery_epoch(), 0);
        assert!(exception_listener.reports().is_empty());
        assert_eq!(broker.stats().connections_created, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_resources_of_parked_invokers() {
        let broker = MemoryBroker::new();
        let orders = Destination::queue("orders");
        broker.send_text(&orders, "order-1");

        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        let container = create_test_builder(&broker)
            .ack_mode(AckMode::Client)
            .max_messages_per_task(1)
            .listener(move |_message| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(anyhow::anyhow!("leave it unacknowledged"))
                }
            })
            .build();

        container.initialize().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || handled.load(Ordering::SeqCst) == 1).await);

        // The refused message is held by the invoker's cached session
        container.stop().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || container.paused_task_count() == 1).await);
        assert_eq!(broker.queue_depth("orders"), 0);

        container.shutdown().await.unwrap();
        assert_eq!(container.scheduled_consumer_count(), 0);
        assert_eq!(broker.queue_depth("orders"), 1);
    }

    #[tokio::test]
    async fn test_transaction_rollback_failure_replaces_setup_error() {
        use crate::error::TransportError;
        use crate::transaction::MockTransactionManager;

        let broker = MemoryBroker::new();
        broker.fail_next_consumers(1);

        let rollbacks = Arc::new(AtomicUsize::new(0));
        let rollback_calls = rollbacks.clone();
        let mut manager = MockTransactionManager::new();
        manager
            .expect_begin()
            .returning(|timeout| Ok(TransactionStatus::new(timeout)));
        manager.expect_commit().returning(|_| Ok(()));
        manager
            .expect_transactional_session()
            .returning(|_| Ok(None));
        manager.expect_rollback().returning(move |_| {
            if rollback_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TransportError::Transaction("rollback refused".to_string()))
            } else {
                Ok(())
            }
        });

        let exception_listener = Arc::new(RecordingExceptionListener::default());
        let container = create_test_builder(&broker)
            .transaction_manager(Arc::new(manager))
            .listener(|_message| async { Ok(()) })
            .exception_listener(exception_listener.clone())
            .build();

        container.initialize().await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || container.recovery_epoch() == 1).await);
        container.shutdown().await.unwrap();

        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
        let reports = exception_listener.reports();
        assert_eq!(reports.len(), 1, "unexpected reports: {:?}", reports);
        assert!(reports[0].contains("rollback refused"), "got {}", reports[0]);
        assert!(!reports[0].contains("Consumer"), "got {}", reports[0]);
    }
}
