// Public API
pub mod config;
pub mod consumer_pool;
pub mod destination;
pub mod error;
pub mod executor;
pub mod handler;
pub mod lifecycle;
pub mod listener;
pub mod memory;
pub mod transaction;
pub mod transport;
pub mod utils;

pub use config::{CacheLevel, Config, ContainerConfig};
pub use consumer_pool::{ContainerBuilder, DefaultListenerContainer};
pub use destination::{Destination, DestinationResolver, DynamicDestinationResolver};
pub use error::{ContainerError, TransportError};
pub use handler::{ExceptionListener, MessageListener};
pub use lifecycle::LifecycleState;
pub use memory::MemoryBroker;
pub use transaction::{TransactionManager, TransactionStatus};
pub use transport::AckMode;

#[cfg(test)]
#[ctor::ctor]
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
