//! Lifecycle core of a listener container.
//!
//! Owns the active/running state machine, the paused-task queue and the shared
//! connection. Two separate monitors are used: a `std::sync::Mutex` for the
//! lifecycle state (never held across an await) and an async mutex for the
//! shared connection, so a connection refresh never blocks state inspection.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ContainerError, Result};
use crate::executor::{ScheduledTask, TaskExecutor};
use crate::transport::{ConnectionFactoryPtr, ConnectionPtr, TransportResult};

/// Container lifecycle state.
///
/// `Stopped` and `Running` are the two active states. Once `Shutdown` is
/// reached no further transition is possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Inactive,
    Stopped,
    Running,
    ShuttingDown,
    Shutdown,
}

impl LifecycleState {
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Running)
    }

    pub fn is_running(self) -> bool {
        self == LifecycleState::Running
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Inactive, Stopped)
                | (Inactive, ShuttingDown)
                | (Stopped, Running)
                | (Stopped, Stopped)
                | (Running, Stopped)
                | (Running, Running)
                | (Stopped, ShuttingDown)
                | (Running, ShuttingDown)
                | (ShuttingDown, Shutdown)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Inactive => "inactive",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Running => "running",
            LifecycleState::ShuttingDown => "shutting down",
            LifecycleState::Shutdown => "shut down",
        };
        f.write_str(label)
    }
}

/// Extension points invoked by the lifecycle core.
#[async_trait::async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Called once from `initialize`, after the container became active.
    async fn do_initialize(&self) -> Result<()>;

    /// Called from `shutdown`; must not return before every worker has exited.
    async fn do_shutdown(&self) -> Result<()>;
}

struct LifecycleMonitor {
    state: LifecycleState,
    paused_tasks: Vec<ScheduledTask>,
}

/// Settings fixed at construction time.
#[derive(Clone)]
pub struct LifecycleSettings {
    pub name: String,
    pub client_id: Option<String>,
    pub auto_startup: bool,
    pub shared_connection_enabled: bool,
}

pub struct ListeningContainer {
    settings: LifecycleSettings,
    connection_factory: ConnectionFactoryPtr,
    task_executor: Arc<dyn TaskExecutor>,
    monitor: Mutex<LifecycleMonitor>,
    state_tx: watch::Sender<LifecycleState>,
    shared_connection: tokio::sync::Mutex<Option<ConnectionPtr>>,
    shutdown_token: CancellationToken,
}

impl ListeningContainer {
    pub fn new(
        settings: LifecycleSettings,
        connection_factory: ConnectionFactoryPtr,
        task_executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::Inactive);
        Self {
            settings,
            connection_factory,
            task_executor,
            monitor: Mutex::new(LifecycleMonitor {
                state: LifecycleState::Inactive,
                paused_tasks: Vec::new(),
            }),
            state_tx,
            shared_connection: tokio::sync::Mutex::new(None),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn client_id(&self) -> Option<&str> {
        self.settings.client_id.as_deref()
    }

    pub fn is_auto_startup(&self) -> bool {
        self.settings.auto_startup
    }

    pub fn is_shared_connection_enabled(&self) -> bool {
        self.settings.shared_connection_enabled
    }

    pub fn connection_factory(&self) -> &ConnectionFactoryPtr {
        &self.connection_factory
    }

    pub fn task_executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.task_executor
    }

    pub fn state(&self) -> LifecycleState {
        self.lock_monitor().state
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Number of tasks waiting for the next `start`.
    pub fn paused_task_count(&self) -> usize {
        self.lock_monitor().paused_tasks.len()
    }

    fn lock_monitor(&self) -> MutexGuard<'_, LifecycleMonitor> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, monitor: &mut LifecycleMonitor, next: LifecycleState) -> Result<()> {
        if !monitor.state.can_transition_to(next) {
            return Err(ContainerError::IllegalState(format!(
                "container '{}' cannot go from {} to {}",
                self.settings.name, monitor.state, next
            )));
        }
        if monitor.state != next {
            debug!("[{}] {} -> {}", self.settings.name, monitor.state, next);
            monitor.state = next;
            self.state_tx.send_replace(next);
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle operations
    // ========================================================================

    /// Activate the container, start it when auto-startup is set, then run
    /// `hooks.do_initialize`.
    ///
    /// Must be called exactly once, on an inactive container; a second call
    /// fails with [`ContainerError::IllegalState`]. When auto-startup is set
    /// and the shared connection cannot be established, the error is
    /// returned and the container stays inactive.
    pub async fn initialize(&self, hooks: &dyn LifecycleHooks) -> Result<()> {
        {
            let monitor = self.lock_monitor();
            if monitor.state != LifecycleState::Inactive {
                return Err(ContainerError::IllegalState(format!(
                    "container '{}' is already initialized ({})",
                    self.settings.name, monitor.state
                )));
            }
        }

        if self.settings.auto_startup && self.settings.shared_connection_enabled {
            if let Err(e) = self.establish_shared_connection().await {
                self.release_shared_connection().await;
                return Err(e.into());
            }
        }

        {
            let mut monitor = self.lock_monitor();
            self.transition(&mut monitor, LifecycleState::Stopped)?;
        }

        let result = async {
            if self.settings.auto_startup {
                self.start().await?;
            }
            hooks.do_initialize().await
        }
        .await;

        if let Err(e) = result {
            self.release_shared_connection().await;
            return Err(e);
        }

        info!("🚀 [{}] Container initialized", self.settings.name);
        Ok(())
    }

    /// Switch to running, resume paused tasks and start the shared connection.
    ///
    /// Establishing or starting the shared connection may fail here without
    /// failing `start`; the invokers recover the connection on their own.
    pub async fn start(&self) -> Result<()> {
        self.ensure_active("start")?;

        if self.settings.shared_connection_enabled {
            if let Err(e) = self.establish_shared_connection().await {
                warn!(
                    "[{}] Could not establish shared connection, leaving it to the invokers: {}",
                    self.settings.name, e
                );
            }
        }

        let paused = {
            let mut monitor = self.lock_monitor();
            self.transition(&mut monitor, LifecycleState::Running)?;
            std::mem::take(&mut monitor.paused_tasks)
        };

        if !paused.is_empty() {
            debug!(
                "[{}] Resuming {} paused task(s)",
                self.settings.name,
                paused.len()
            );
        }
        for task in paused {
            self.task_executor.execute(task);
        }

        if self.settings.shared_connection_enabled {
            self.start_shared_connection().await;
        }

        info!("▶️ [{}] Container started", self.settings.name);
        Ok(())
    }

    /// Switch to stopped. Invokers notice at their next loop iteration.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut monitor = self.lock_monitor();
            if !monitor.state.is_active() {
                return Err(ContainerError::IllegalState(format!(
                    "cannot stop container '{}' while {}",
                    self.settings.name, monitor.state
                )));
            }
            self.transition(&mut monitor, LifecycleState::Stopped)?;
        }

        if self.settings.shared_connection_enabled {
            self.stop_shared_connection().await;
        }

        info!("⏸️ [{}] Container stopped", self.settings.name);
        Ok(())
    }

    /// Deactivate the container, wait for `hooks.do_shutdown` and release the
    /// shared connection. Calling it again is a no-op.
    pub async fn shutdown(&self, hooks: &dyn LifecycleHooks) -> Result<()> {
        let was_running = {
            let mut monitor = self.lock_monitor();
            if matches!(
                monitor.state,
                LifecycleState::ShuttingDown | LifecycleState::Shutdown
            ) {
                debug!("[{}] Shutdown already requested", self.settings.name);
                return Ok(());
            }
            let was_running = monitor.state.is_running();
            self.transition(&mut monitor, LifecycleState::ShuttingDown)?;

            let discarded = monitor.paused_tasks.len();
            monitor.paused_tasks.clear();
            if discarded > 0 {
                debug!(
                    "[{}] Discarded {} paused task(s)",
                    self.settings.name, discarded
                );
            }
            was_running
        };

        info!("🛑 [{}] Shutting down container", self.settings.name);
        self.shutdown_token.cancel();

        if was_running && self.settings.shared_connection_enabled {
            self.stop_shared_connection().await;
        }

        let result = hooks.do_shutdown().await;
        self.release_shared_connection().await;

        {
            let mut monitor = self.lock_monitor();
            self.transition(&mut monitor, LifecycleState::Shutdown)?;
        }

        info!("✅ [{}] Container shut down", self.settings.name);
        result
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        let state = self.state();
        if state.is_active() {
            Ok(())
        } else {
            Err(ContainerError::IllegalState(format!(
                "cannot {} container '{}' while {}",
                operation, self.settings.name, state
            )))
        }
    }

    // ========================================================================
    // Worker coordination
    // ========================================================================

    /// Wait until the container is running or no longer active.
    ///
    /// Returns `true` when running, `false` once the container is inactive.
    pub async fn wait_while_not_running(&self) -> bool {
        let mut rx = self.state_tx.subscribe();
        let result = rx
            .wait_for(|state| state.is_running() || !state.is_active())
            .await
            .map(|state| state.is_running());
        result.unwrap_or(false)
    }

    /// Run `task` now when running, park it when stopped.
    ///
    /// Returns `false` once the container is inactive; the task is dropped.
    pub fn reschedule_task_if_necessary(&self, task: ScheduledTask) -> bool {
        let mut monitor = self.lock_monitor();
        match monitor.state {
            LifecycleState::Running => {
                drop(monitor);
                self.task_executor.execute(task);
                true
            }
            LifecycleState::Stopped => {
                monitor.paused_tasks.push(task);
                true
            }
            _ => false,
        }
    }

    /// Sleep for `duration` unless shutdown begins first.
    ///
    /// Returns `false` when interrupted.
    pub async fn sleep_interruptibly(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown_token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Resolves once shutdown has begun.
    pub async fn shutdown_requested(&self) {
        self.shutdown_token.cancelled().await
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Open a new connection and apply the client id, if any.
    pub async fn create_connection(&self) -> TransportResult<ConnectionPtr> {
        let connection = self.connection_factory.create_connection().await?;
        if let Some(client_id) = &self.settings.client_id {
            if let Err(e) = connection.set_client_id(client_id).await {
                close_quietly(&connection).await;
                return Err(e);
            }
        }
        Ok(connection)
    }

    /// Create the shared connection unless one is already present.
    pub async fn establish_shared_connection(&self) -> TransportResult<()> {
        let mut shared = self.shared_connection.lock().await;
        if shared.is_none() {
            let connection = self.create_connection().await?;
            debug!(
                "[{}] Established shared connection {}",
                self.settings.name,
                connection.id()
            );
            *shared = Some(connection);
        }
        Ok(())
    }

    /// Replace the shared connection with a fresh one, started when the
    /// container is running.
    pub async fn refresh_shared_connection(&self) -> TransportResult<ConnectionPtr> {
        let mut shared = self.shared_connection.lock().await;
        if let Some(old) = shared.take() {
            close_quietly(&old).await;
        }

        let connection = self.create_connection().await?;
        if self.is_running() {
            if let Err(e) = connection.start().await {
                if !e.is_illegal_state() {
                    close_quietly(&connection).await;
                    return Err(e);
                }
            }
        }
        debug!(
            "[{}] Refreshed shared connection, now {}",
            self.settings.name,
            connection.id()
        );
        *shared = Some(connection.clone());
        Ok(connection)
    }

    /// The current shared connection.
    pub async fn shared_connection(&self) -> Result<ConnectionPtr> {
        if !self.settings.shared_connection_enabled {
            return Err(ContainerError::IllegalState(format!(
                "container '{}' does not use a shared connection",
                self.settings.name
            )));
        }
        self.shared_connection
            .lock()
            .await
            .clone()
            .ok_or(ContainerError::SharedConnectionNotInitialized)
    }

    async fn start_shared_connection(&self) {
        let shared = self.shared_connection.lock().await;
        if let Some(connection) = shared.as_ref() {
            match connection.start().await {
                Ok(()) => {}
                Err(e) if e.is_illegal_state() => {
                    debug!(
                        "[{}] Ignoring connection start failure, assuming already started: {}",
                        self.settings.name, e
                    );
                }
                Err(e) => {
                    warn!(
                        "[{}] Could not start shared connection, leaving it to the invokers: {}",
                        self.settings.name, e
                    );
                }
            }
        }
    }

    async fn stop_shared_connection(&self) {
        let shared = self.shared_connection.lock().await;
        if let Some(connection) = shared.as_ref() {
            if let Err(e) = connection.stop().await {
                debug!(
                    "[{}] Ignoring shared connection stop failure: {}",
                    self.settings.name, e
                );
            }
        }
    }

    /// Close and forget the shared connection.
    pub async fn release_shared_connection(&self) {
        let mut shared = self.shared_connection.lock().await;
        if let Some(connection) = shared.take() {
            close_quietly(&connection).await;
            debug!(
                "[{}] Released shared connection {}",
                self.settings.name,
                connection.id()
            );
        }
    }
}

/// Close a connection, logging any failure at debug level.
pub async fn close_quietly(connection: &ConnectionPtr) {
    if let Err(e) = connection.close().await {
        debug!("Could not close connection {}: {}", connection.id(), e);
    }
}
