use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};
use crate::destination::{DestinationResolver, DynamicDestinationResolver};
use crate::memory::MemoryBroker;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when it is set.
pub fn initialize_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false);

    let result = if config.output.eq_ignore_ascii_case("stderr") {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}

/// Load the configuration, also trying the parent directory.
pub fn load_configuration(path: &str) -> Result<Config> {
    Config::load(path).or_else(|_| Config::load(&format!("../{}", path)))
}

pub fn display_startup_info(config: &Config) {
    info!("🚀 Starting {} v{}", config.service.name, config.service.version);
    if !config.service.description.is_empty() {
        info!("📋 {}", config.service.description);
    }
    for container in &config.containers {
        info!(
            "📦 Container '{}': destination {}, {} consumer(s), cache {}, transacted {}",
            container.name,
            container.destination.as_deref().unwrap_or("<none>"),
            container.concurrent_consumers,
            container
                .cache_level
                .map(|level| level.to_string())
                .unwrap_or_else(|| "auto".to_string()),
            container.session_transacted
        );
    }
    info!("⏱️ Shutdown timeout: {}s", config.shutdown.timeout_secs);
}

/// Publish the demo traffic to every configured container destination.
///
/// Every `fail_every`-th message carries `fail: true`.
pub async fn send_demo_messages(broker: &MemoryBroker, config: &Config) {
    let resolver = DynamicDestinationResolver;
    let interval = Duration::from_millis(config.demo.publish_interval_ms);

    for round in 1..=config.demo.messages_per_destination {
        for container in &config.containers {
            let Some(name) = container.destination.as_deref() else {
                continue;
            };
            let destination = match resolver.resolve(name, container.pub_sub_domain).await {
                Ok(destination) => destination,
                Err(e) => {
                    warn!("Skipping demo traffic for '{}': {}", container.name, e);
                    continue;
                }
            };

            let mut headers = HashMap::new();
            let fail_every = config.demo.fail_every;
            if fail_every > 0 && round % fail_every == 0 {
                headers.insert("fail".to_string(), "true".to_string());
            }
            let body = format!("{} message #{}", container.name, round);
            let id = broker.send(&destination, body, headers);
            debug!("📤 Published {} to {}", id, destination);
        }
        tokio::time::sleep(interval).await;
    }
    info!(
        "✅ Published {} demo message(s) per destination",
        config.demo.messages_per_destination
    );
}

/// Setup signal handlers for graceful shutdown
pub async fn setup_signal_handlers() {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    error!("Unable to register signal handlers: {}", e);
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM - initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("📡 Received SIGINT (Ctrl+C) - initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("📡 Received Ctrl+C - initiating graceful shutdown");
            }
            Err(err) => {
                error!("Unable to listen for shutdown signal: {}", err);
            }
        }
    }
}
