//! Configuration for tabletloc components
//!
//! Layered with the `config` crate: an optional TOML file, then
//! `TABLETLOC_*` environment variables (`__` separates nested keys).

use crate::common::{Error, Result};
use crate::coordinator::mode::LocationMode;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Name of the last-location mode property, both as a config key and as
/// a coordination-service property node.
pub const LAST_LOCATION_MODE_KEY: &str = "last-location-persistence-mode";

/// Buffered writes per tablet before a tablet server persists on its own.
/// Changeable at runtime.
pub const MEMTABLE_MAX_ENTRIES_KEY: &str = "tserver.memtable-max-entries";

/// System properties published to the coordination service. Every process
/// keeps one watch per property so runtime changes reach it.
pub const SYSTEM_PROPERTIES: &[&str] = &[
    LAST_LOCATION_MODE_KEY,
    "instance.name",
    "manager.assignment-interval",
    "manager.cas-max-retries",
    "admin.wait-timeout",
    "admin.wait-initial-backoff",
    "admin.wait-max-backoff",
    "tserver.session-timeout",
    MEMTABLE_MAX_ENTRIES_KEY,
    "watch.resync-attempts",
    "watch.budget-base",
    "watch.budget-per-table",
    "log.level",
];

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Instance label
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// When the `last` location of a tablet is updated
    #[serde(
        rename = "last-location-persistence-mode",
        alias = "last_location_persistence_mode",
        default
    )]
    pub last_location_mode: LocationMode,

    #[serde(default)]
    pub manager: ManagerConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_instance_name() -> String {
    "tabletloc".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            last_location_mode: LocationMode::default(),
            manager: ManagerConfig::default(),
            admin: AdminConfig::default(),
            watch: WatchConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from `TABLETLOC_CONFIG` (or `tabletloc.toml` if present) and the
    /// environment. An unrecognized mode is fatal.
    pub fn load() -> Result<Self> {
        let file = std::env::var("TABLETLOC_CONFIG").unwrap_or_else(|_| "tabletloc".into());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&file).required(false))
            .add_source(
                config::Environment::with_prefix("TABLETLOC")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?;
        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.manager.tablet_servers == 0 {
            return Err(Error::ConfigurationInvalid(
                "manager.tablet_servers must be at least 1".into(),
            ));
        }
        if self.manager.session_timeout_ms == 0 {
            return Err(Error::ConfigurationInvalid(
                "manager.session_timeout_ms must be positive".into(),
            ));
        }
        if self.admin.initial_backoff_ms > self.admin.max_backoff_ms {
            return Err(Error::ConfigurationInvalid(
                "admin.initial_backoff_ms exceeds admin.max_backoff_ms".into(),
            ));
        }
        let budget = &self.watch.budget;
        if budget.base_min > budget.base_max || budget.per_table_min > budget.per_table_max {
            return Err(Error::ConfigurationInvalid(
                "watch.budget minimums must not exceed maximums".into(),
            ));
        }
        Ok(())
    }

    /// Value of a system property as published to the coordination service.
    pub fn property_value(&self, key: &str) -> Option<String> {
        let value = match key {
            LAST_LOCATION_MODE_KEY => self.last_location_mode.to_string(),
            "instance.name" => self.instance_name.clone(),
            "manager.assignment-interval" => format!("{}ms", self.manager.assignment_interval_ms),
            "manager.cas-max-retries" => self.manager.cas_max_retries.to_string(),
            "admin.wait-timeout" => format!("{}ms", self.admin.wait_timeout_ms),
            "admin.wait-initial-backoff" => format!("{}ms", self.admin.initial_backoff_ms),
            "admin.wait-max-backoff" => format!("{}ms", self.admin.max_backoff_ms),
            "tserver.session-timeout" => format!("{}ms", self.manager.session_timeout_ms),
            MEMTABLE_MAX_ENTRIES_KEY => self.manager.memtable_max_entries.to_string(),
            "watch.resync-attempts" => self.watch.resync_attempts.to_string(),
            "watch.budget-base" => format!(
                "{}..={}",
                self.watch.budget.base_min, self.watch.budget.base_max
            ),
            "watch.budget-per-table" => format!(
                "{}..={}",
                self.watch.budget.per_table_min, self.watch.budget.per_table_max
            ),
            "log.level" => self.log_level.clone(),
            _ => return None,
        };
        Some(value)
    }
}

/// Manager (assignment authority) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// Bind address for the coordination-service monitor (four-letter words)
    #[serde(default = "default_monitor_addr")]
    pub monitor_addr: SocketAddr,

    /// RocksDB path for the metadata store; in-memory when absent
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Number of in-process tablet servers
    #[serde(default = "default_tablet_servers")]
    pub tablet_servers: usize,

    /// Assignment loop tick
    #[serde(default = "default_assignment_interval")]
    pub assignment_interval_ms: u64,

    /// Bounded CAS retries per transition
    #[serde(default = "default_cas_max_retries")]
    pub cas_max_retries: u32,

    /// Coordination session timeout: a process not heard from within it
    /// loses its session (and with it its watches and locks)
    #[serde(default = "default_session_timeout")]
    pub session_timeout_ms: u64,

    /// Buffered writes per tablet before a tablet server flushes on its own
    #[serde(default = "default_memtable_max_entries")]
    pub memtable_max_entries: usize,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9995))
}
fn default_monitor_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 2181))
}
fn default_tablet_servers() -> usize {
    1
}
fn default_assignment_interval() -> u64 {
    250
}
fn default_cas_max_retries() -> u32 {
    16
}
fn default_session_timeout() -> u64 {
    30_000
}
fn default_memtable_max_entries() -> usize {
    100_000
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            monitor_addr: default_monitor_addr(),
            db_path: None,
            tablet_servers: default_tablet_servers(),
            assignment_interval_ms: default_assignment_interval(),
            cas_max_retries: default_cas_max_retries(),
            session_timeout_ms: default_session_timeout(),
            memtable_max_entries: default_memtable_max_entries(),
        }
    }
}

impl ManagerConfig {
    pub fn assignment_interval(&self) -> Duration {
        Duration::from_millis(self.assignment_interval_ms.max(1))
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms.max(1))
    }
}

/// Administrative wait-mode configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_wait_timeout() -> u64 {
    60_000
}
fn default_initial_backoff() -> u64 {
    10
}
fn default_max_backoff() -> u64 {
    500
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: default_wait_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl AdminConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Watch registrar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Re-registration attempts per target after a session is re-established
    #[serde(default = "default_resync_attempts")]
    pub resync_attempts: usize,

    #[serde(default)]
    pub budget: BudgetConfig,
}

fn default_resync_attempts() -> usize {
    5
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            resync_attempts: default_resync_attempts(),
            budget: BudgetConfig::default(),
        }
    }
}

/// Expected envelope of active watches: `base + per_table * tables`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_base_min")]
    pub base_min: u64,
    #[serde(default = "default_base_max")]
    pub base_max: u64,
    #[serde(default = "default_per_table_min")]
    pub per_table_min: u64,
    #[serde(default = "default_per_table_max")]
    pub per_table_max: u64,
}

fn default_base_min() -> u64 {
    110
}
fn default_base_max() -> u64 {
    125
}
fn default_per_table_min() -> u64 {
    15
}
fn default_per_table_max() -> u64 {
    20
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            base_min: default_base_min(),
            base_max: default_base_max(),
            per_table_min: default_per_table_min(),
            per_table_max: default_per_table_max(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.last_location_mode, LocationMode::Compaction);
        assert_eq!(config.manager.tablet_servers, 1);
        assert_eq!(config.watch.budget.base_min, 110);
        assert_eq!(config.admin.wait_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_mode_from_toml() {
        let config = Config::from_toml_str(
            r#"
            last-location-persistence-mode = "assignment"

            [manager]
            tablet_servers = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.last_location_mode, LocationMode::Assignment);
        assert_eq!(config.manager.tablet_servers, 3);
    }

    #[test]
    fn test_unknown_mode_is_fatal() {
        let err = Config::from_toml_str(r#"last-location-persistence-mode = "eventually""#)
            .unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_invalid_budget() {
        let err = Config::from_toml_str(
            r#"
            [watch.budget]
            base_min = 200
            base_max = 100
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_zero_session_timeout_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            [manager]
            session_timeout_ms = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[test]
    fn test_every_system_property_has_a_value() {
        let config = Config::default();
        for key in SYSTEM_PROPERTIES {
            assert!(config.property_value(key).is_some(), "missing {}", key);
        }
        assert_eq!(
            config.property_value(LAST_LOCATION_MODE_KEY).as_deref(),
            Some("compaction")
        );
    }
}
