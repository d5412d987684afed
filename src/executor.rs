use futures::future::BoxFuture;
use tracing::trace;

/// A unit of work handed to a [`TaskExecutor`]: one invoker run.
pub type ScheduledTask = BoxFuture<'static, ()>;

/// Runs invoker tasks.
///
/// Each invoker occupies its task for as long as it keeps receiving, so an
/// implementation must not serialize tasks onto a single worker.
#[cfg_attr(test, mockall::automock)]
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: ScheduledTask);
}

/// Spawns every task onto the current tokio runtime.
#[derive(Debug, Default, Clone)]
pub struct TokioTaskExecutor;

impl TaskExecutor for TokioTaskExecutor {
    fn execute(&self, task: ScheduledTask) {
        trace!("Spawning invoker task");
        tokio::spawn(task);
    }
}
