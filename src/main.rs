use std::sync::Arc;

use anyhow::Result;
use broker_listener_container::handler::{LoggingExceptionListener, MessageHandlers};
use broker_listener_container::{utils, DefaultListenerContainer, MemoryBroker};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = utils::load_configuration("config.yaml")?;
    utils::initialize_logging(&config.logging);
    utils::display_startup_info(&config);

    let broker = MemoryBroker::new();

    let mut containers = Vec::new();
    for container_config in &config.containers {
        let container = DefaultListenerContainer::builder(broker.connection_factory())
            .config(container_config.clone())
            .message_listener(MessageHandlers::validating_listener())
            .exception_listener(Arc::new(LoggingExceptionListener))
            .build();
        container.initialize().await?;
        info!(
            "✅ Container '{}' listening on {} ({})",
            container.name(),
            container.destination_description(),
            container.state()
        );
        containers.push(container);
    }

    let publisher_broker = broker.clone();
    let publisher_config = config.clone();
    tokio::spawn(async move {
        utils::send_demo_messages(&publisher_broker, &publisher_config).await;
    });

    utils::setup_signal_handlers().await;

    info!("🛑 Shutting down {} container(s)", containers.len());
    let shutdown_all = futures::future::join_all(containers.iter().map(|container| async move {
        if let Err(e) = container.shutdown().await {
            error!("Failed to shut down container '{}': {}", container.name(), e);
        }
    }));
    if tokio::time::timeout(config.get_shutdown_timeout(), shutdown_all)
        .await
        .is_err()
    {
        warn!(
            "⏰ Shutdown timed out after {}s, exiting anyway",
            config.shutdown.timeout_secs
        );
    }

    let stats = broker.stats();
    info!(
        "📊 Delivered {} message(s): {} commit(s), {} rollback(s)",
        stats.delivered, stats.commits, stats.rollbacks
    );
    info!("✅ Shutdown complete");
    Ok(())
}
