use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::transport::SessionPtr;

/// Handle to a transaction begun by a [`TransactionManager`].
///
/// Clones share the rollback-only flag, so a listener failure deep inside a
/// receive iteration can veto the commit issued by the outer wrapper.
#[derive(Debug, Clone, Default)]
pub struct TransactionStatus {
    rollback_only: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl TransactionStatus {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            rollback_only: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// External transaction coordination.
///
/// When configured, every receive iteration runs inside `begin` ... `commit`
/// (or `rollback`). The container never inspects how the manager enlists
/// resources.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self, timeout: Option<Duration>) -> Result<TransactionStatus, TransportError>;

    async fn commit(&self, status: &TransactionStatus) -> Result<(), TransportError>;

    async fn rollback(&self, status: &TransactionStatus) -> Result<(), TransportError>;

    /// Session already bound to `status`, if the manager synchronizes one.
    ///
    /// A bound session is used for the iteration instead of the invoker's own
    /// and the container never commits it locally.
    async fn transactional_session(
        &self,
        _status: &TransactionStatus,
    ) -> Result<Option<SessionPtr>, TransportError> {
        Ok(None)
    }
}

/// Commit `status` unless it was marked rollback-only, in which case roll it back.
pub async fn complete(
    manager: &dyn TransactionManager,
    status: &TransactionStatus,
) -> Result<(), TransportError> {
    if status.is_rollback_only() {
        manager.rollback(status).await
    } else {
        manager.commit(status).await
    }
}
