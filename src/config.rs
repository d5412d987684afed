use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::time::Duration;

use crate::error::ContainerError;
use crate::transport::AckMode;

/// Main configuration structure that mirrors the config.yaml file
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub service: ServiceConfig,
    #[serde(default = "LoggingConfig::default")]
    pub logging: LoggingConfig,
    #[serde(default = "ShutdownConfig::default")]
    pub shutdown: ShutdownConfig,
    #[serde(default = "DemoConfig::default")]
    pub demo: DemoConfig,
    #[serde(default)]
    pub containers: Vec<ContainerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub output: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ShutdownConfig {
    /// Upper bound for draining every container on exit
    pub timeout_secs: u64,
}

/// Sample traffic published by the demo binary
#[derive(Debug, Deserialize, Clone)]
pub struct DemoConfig {
    pub messages_per_destination: u32,
    pub publish_interval_ms: u64,
    /// Every n-th message is marked to fail in the validating handler; 0 disables
    #[serde(default)]
    pub fail_every: u32,
}

/// How much broker state an invoker keeps between receive iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    None,
    Connection,
    Session,
    Consumer,
}

impl CacheLevel {
    /// Map the classic integer constants, NONE=0 through CONSUMER=3.
    pub fn from_i32(level: i32) -> Option<Self> {
        match level {
            0 => Some(CacheLevel::None),
            1 => Some(CacheLevel::Connection),
            2 => Some(CacheLevel::Session),
            3 => Some(CacheLevel::Consumer),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            CacheLevel::None => 0,
            CacheLevel::Connection => 1,
            CacheLevel::Session => 2,
            CacheLevel::Consumer => 3,
        }
    }

    pub fn caches_connection(self) -> bool {
        self >= CacheLevel::Connection
    }

    pub fn caches_session(self) -> bool {
        self >= CacheLevel::Session
    }

    pub fn caches_consumer(self) -> bool {
        self >= CacheLevel::Consumer
    }
}

impl TryFrom<i32> for CacheLevel {
    type Error = ContainerError;

    fn try_from(level: i32) -> std::result::Result<Self, Self::Error> {
        CacheLevel::from_i32(level)
            .ok_or_else(|| ContainerError::Config(format!("unknown cache level {}", level)))
    }
}

impl fmt::Display for CacheLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CacheLevel::None => "none",
            CacheLevel::Connection => "connection",
            CacheLevel::Session => "session",
            CacheLevel::Consumer => "consumer",
        };
        f.write_str(label)
    }
}

/// Settings for one listener container.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ContainerConfig {
    pub name: String,
    /// Destination name; `/queue/` and `/topic/` prefixes pick the kind
    pub destination: Option<String>,
    pub pub_sub_domain: bool,
    pub message_selector: Option<String>,
    pub pub_sub_no_local: bool,
    pub client_id: Option<String>,
    pub concurrent_consumers: u32,
    /// Receive attempts per task before it is rescheduled. -1 means unlimited.
    pub max_messages_per_task: i32,
    /// Unset picks `consumer` without a transaction manager and `none` with one
    pub cache_level: Option<CacheLevel>,
    /// Zero or negative blocks until a message arrives
    pub receive_timeout_ms: i64,
    pub recovery_interval_ms: u64,
    pub session_transacted: bool,
    pub ack_mode: AckMode,
    pub auto_startup: bool,
    pub accept_messages_while_stopping: bool,
    pub expose_listener_session: bool,
    pub transaction_timeout_secs: Option<u64>,
}

pub const DEFAULT_RECEIVE_TIMEOUT_MS: i64 = 1000;
pub const DEFAULT_RECOVERY_INTERVAL_MS: u64 = 5000;

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            name: "listener-container".to_string(),
            destination: None,
            pub_sub_domain: false,
            message_selector: None,
            pub_sub_no_local: false,
            client_id: None,
            concurrent_consumers: 1,
            max_messages_per_task: -1,
            cache_level: None,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            recovery_interval_ms: DEFAULT_RECOVERY_INTERVAL_MS,
            session_transacted: false,
            ack_mode: AckMode::Auto,
            auto_startup: true,
            accept_messages_while_stopping: false,
            expose_listener_session: true,
            transaction_timeout_secs: None,
        }
    }
}

impl ContainerConfig {
    /// `None` means block until a message arrives.
    pub fn receive_timeout(&self) -> Option<Duration> {
        if self.receive_timeout_ms > 0 {
            Some(Duration::from_millis(self.receive_timeout_ms as u64))
        } else {
            None
        }
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    pub fn transaction_timeout(&self) -> Option<Duration> {
        self.transaction_timeout_secs.map(Duration::from_secs)
    }

    pub fn effective_cache_level(&self, has_transaction_manager: bool) -> CacheLevel {
        self.cache_level.unwrap_or(if has_transaction_manager {
            CacheLevel::None
        } else {
            CacheLevel::Consumer
        })
    }

    /// `None` for unlimited.
    pub fn message_quota(&self) -> Option<u32> {
        u32::try_from(self.max_messages_per_task)
            .ok()
            .filter(|quota| *quota > 0)
    }

    pub fn selector(&self) -> Option<&str> {
        self.message_selector
            .as_deref()
            .filter(|selector| !selector.trim().is_empty())
    }

    /// Check the settings that can be checked without a listener.
    pub fn validate(&self) -> std::result::Result<(), ContainerError> {
        match self.destination.as_deref() {
            Some(destination) if !destination.trim().is_empty() => {}
            _ => {
                return Err(ContainerError::Config(format!(
                    "container '{}' has no destination",
                    self.name
                )))
            }
        }
        if self.concurrent_consumers < 1 {
            return Err(ContainerError::Config(format!(
                "container '{}' needs at least one concurrent consumer",
                self.name
            )));
        }
        if self.max_messages_per_task == 0 {
            return Err(ContainerError::Config(format!(
                "container '{}' has max_messages_per_task 0, use -1 for unlimited",
                self.name
            )));
        }
        Ok(())
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            messages_per_destination: 10,
            publish_interval_ms: 200,
            fail_every: 0,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    pub fn get_container_config(&self, name: &str) -> Option<&ContainerConfig> {
        self.containers.iter().find(|c| c.name == name)
    }

    pub fn get_all_container_names(&self) -> Vec<String> {
        self.containers.iter().map(|c| c.name.clone()).collect()
    }

    pub fn get_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config_yaml() -> &'static str {
        r#"
service:
  name: "test-service"
  version: "1.0.0"
  description: "Test service"

logging:
  level: "debug"
  output: "stdout"

shutdown:
  timeout_secs: 10

demo:
  messages_per_destination: 5
  publish_interval_ms: 100
  fail_every: 3

containers:
  - name: "orders"
    destination: "/queue/orders"
    concurrent_consumers: 3
    cache_level: "consumer"
    receive_timeout_ms: 500
    recovery_interval_ms: 2000
    session_transacted: true
  - name: "prices"
    destination: "prices"
    pub_sub_domain: true
    pub_sub_no_local: true
    message_selector: "region = 'eu'"
    ack_mode: "client"
    client_id: "pricing-service"
    max_messages_per_task: 10
    auto_startup: false
"#
    }

    // ========================================================================
    // LOADING
    // ========================================================================

    #[test]
    fn test_config_parsing() {
        let config: Config = serde_yaml::from_str(create_test_config_yaml()).unwrap();
        assert_eq!(config.service.name, "test-service");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.get_shutdown_timeout(), Duration::from_secs(10));
        assert_eq!(config.demo.fail_every, 3);
        assert_eq!(config.get_all_container_names(), vec!["orders", "prices"]);

        let orders = config.get_container_config("orders").unwrap();
        assert_eq!(orders.destination.as_deref(), Some("/queue/orders"));
        assert_eq!(orders.concurrent_consumers, 3);
        assert_eq!(orders.cache_level, Some(CacheLevel::Consumer));
        assert_eq!(orders.receive_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(orders.recovery_interval(), Duration::from_secs(2));
        assert!(orders.session_transacted);
        assert!(orders.auto_startup);

        let prices = config.get_container_config("prices").unwrap();
        assert!(prices.pub_sub_domain);
        assert!(prices.pub_sub_no_local);
        assert_eq!(prices.selector(), Some("region = 'eu'"));
        assert_eq!(prices.ack_mode, AckMode::Client);
        assert_eq!(prices.client_id.as_deref(), Some("pricing-service"));
        assert_eq!(prices.message_quota(), Some(10));
        assert!(!prices.auto_startup);

        assert!(config.get_container_config("missing").is_none());
    }

    #[test]
    fn test_config_load_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "{}", create_test_config_yaml()).unwrap();

        let config = Config::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.service.name, "test-service");
        assert_eq!(config.containers.len(), 2);
    }

    #[test]
    fn test_config_load_nonexistent_file() {
        let result = Config::load("nonexistent_file.yaml");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to read config file"));
    }

    #[test]
    fn test_config_load_invalid_yaml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "invalid: yaml: content: [unclosed").unwrap();

        let result = Config::load(temp_file.path().to_str().unwrap());
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[test]
    fn test_config_with_defaults() {
        let minimal_yaml = r#"
service:
  name: "minimal-service"
  version: "0.1.0"
containers:
  - destination: "orders"
"#;
        let config: Config = serde_yaml::from_str(minimal_yaml).unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.shutdown.timeout_secs, 30);
        assert_eq!(config.demo.messages_per_destination, 10);

        let container = &config.containers[0];
        assert_eq!(container.name, "listener-container");
        assert_eq!(container.concurrent_consumers, 1);
        assert_eq!(container.receive_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(container.recovery_interval(), Duration::from_secs(5));
        assert_eq!(container.ack_mode, AckMode::Auto);
        assert!(container.auto_startup);
        assert!(container.expose_listener_session);
        assert!(!container.accept_messages_while_stopping);
        assert_eq!(container.message_quota(), None);
        assert_eq!(container.transaction_timeout(), None);
    }

    // ========================================================================
    // CONTAINER SETTINGS
    // ========================================================================

    #[test]
    fn test_effective_cache_level() {
        let mut config = ContainerConfig::default();
        assert_eq!(config.effective_cache_level(false), CacheLevel::Consumer);
        assert_eq!(config.effective_cache_level(true), CacheLevel::None);

        config.cache_level = Some(CacheLevel::Session);
        assert_eq!(config.effective_cache_level(true), CacheLevel::Session);
    }

    #[test]
    fn test_receive_timeout_non_positive_blocks() {
        let config = ContainerConfig {
            receive_timeout_ms: 0,
            ..ContainerConfig::default()
        };
        assert_eq!(config.receive_timeout(), None);

        let config = ContainerConfig {
            receive_timeout_ms: -1,
            ..ContainerConfig::default()
        };
        assert_eq!(config.receive_timeout(), None);
    }

    #[test]
    fn test_blank_selector_is_ignored() {
        let config = ContainerConfig {
            message_selector: Some("   ".to_string()),
            ..ContainerConfig::default()
        };
        assert_eq!(config.selector(), None);
    }

    #[test]
    fn test_validate() {
        let valid = ContainerConfig {
            destination: Some("orders".to_string()),
            ..ContainerConfig::default()
        };
        assert!(valid.validate().is_ok());

        let no_destination = ContainerConfig::default();
        assert!(matches!(
            no_destination.validate(),
            Err(ContainerError::Config(_))
        ));

        let blank_destination = ContainerConfig {
            destination: Some("  ".to_string()),
            ..ContainerConfig::default()
        };
        assert!(blank_destination.validate().is_err());

        let no_consumers = ContainerConfig {
            concurrent_consumers: 0,
            ..valid.clone()
        };
        assert!(no_consumers.validate().is_err());

        let zero_quota = ContainerConfig {
            max_messages_per_task: 0,
            ..valid.clone()
        };
        assert!(zero_quota.validate().is_err());
    }

    #[test]
    fn test_cache_level_codes() {
        assert_eq!(CacheLevel::from_i32(0), Some(CacheLevel::None));
        assert_eq!(CacheLevel::from_i32(3), Some(CacheLevel::Consumer));
        assert_eq!(CacheLevel::from_i32(4), None);
        assert!(CacheLevel::try_from(-1).is_err());
        assert_eq!(CacheLevel::try_from(2).unwrap(), CacheLevel::Session);
    }

    #[test]
    fn test_cache_level_ordering() {
        assert!(CacheLevel::Consumer.caches_session());
        assert!(CacheLevel::Session.caches_connection());
        assert!(!CacheLevel::Session.caches_consumer());
        assert!(!CacheLevel::None.caches_connection());
        assert_eq!(CacheLevel::Connection.to_string(), "connection");
    }

    proptest! {
        #[test]
        fn prop_cache_level_code_round_trip(code in 0i32..4) {
            let level = CacheLevel::from_i32(code).unwrap();
            prop_assert_eq!(level.as_i32(), code);
        }

        #[test]
        fn prop_cache_level_rejects_out_of_range(code in prop_oneof![i32::MIN..0, 4..i32::MAX]) {
            prop_assert!(CacheLevel::from_i32(code).is_none());
        }

        #[test]
        fn prop_message_quota_only_for_positive(limit in any::<i32>()) {
            let config = ContainerConfig { max_messages_per_task: limit, ..ContainerConfig::default() };
            prop_assert_eq!(config.message_quota().is_some(), limit > 0);
        }
    }
}
