#![allow(dead_code)]
//! Configuration (spec §6): sections `logging`, `host`, `api`, `ext_server`,
//! `csms`, `balanz`, `model`, `history`. The original is an INI file;
//! `figment`'s TOML provider represents the same section/key shape — parsing
//! the literal `.ini` grammar is the one piece of "file format" the spec
//! excludes as a feature, the documented defaults are still honored.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AppConfig {
    #[validate(nested)]
    pub logging: LoggingConfig,
    #[validate(nested)]
    pub host: HostConfig,
    #[validate(nested)]
    pub api: ApiConfig,
    #[validate(nested)]
    pub ext_server: ExtServerConfig,
    #[validate(nested)]
    pub csms: CsmsConfig,
    #[validate(nested)]
    pub balanz: BalanzConfig,
    #[validate(nested)]
    pub model: ModelConfig,
    #[validate(nested)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), json: false }
    }
}

/// Bind address for the combined OCPP-J/admin WebSocket listener.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HostConfig {
    #[validate(length(min = 1))]
    pub bind: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
}

impl HostConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port).parse().context("failed to parse host.bind/host.port as a socket address")
    }
}

/// Admin API authentication behavior (spec §6, §9 open question).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ApiConfig {
    #[serde(default)]
    pub dev_mode: bool,
    /// Allows `Login`-equivalent credentials to arrive inside OCPP framing
    /// instead of HTTP Basic. Must never be trusted in production; refused
    /// outright unless `dev_mode` is also set.
    #[serde(default)]
    pub allow_protocol_auth: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { dev_mode: false, allow_protocol_auth: false }
    }
}

impl ApiConfig {
    pub fn protocol_auth_enabled(&self) -> bool {
        self.dev_mode && self.allow_protocol_auth
    }
}

/// Reserved for an upstream-CSMS forwarding mode (explicit Non-goal: not
/// implemented). Parsed so the section round-trips through config files
/// without error; `enabled` is refused at startup if set.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ExtServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for ExtServerConfig {
    fn default() -> Self {
        Self { enabled: false, url: None }
    }
}

/// Charging-station-management-system-facing timing (spec §4.3, §4.6).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CsmsConfig {
    #[serde(default = "default_boot_interval_secs")]
    #[validate(range(min = 10, max = 3600))]
    pub boot_interval_secs: u32,
    #[serde(default = "default_watchdog_stale_secs")]
    #[validate(range(min = 10))]
    pub watchdog_stale_secs: u64,
    #[serde(default = "default_transaction_timeout_secs")]
    #[validate(range(min = 10))]
    pub transaction_timeout_secs: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub allow_unknown_tags: bool,
    #[serde(default)]
    pub autoregister_group: Option<String>,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            boot_interval_secs: default_boot_interval_secs(),
            watchdog_stale_secs: default_watchdog_stale_secs(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            call_timeout_ms: default_call_timeout_ms(),
            allow_unknown_tags: false,
            autoregister_group: None,
        }
    }
}

/// Smart-charging allocator loop (spec §4.4, §8 scenario defaults).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct BalanzConfig {
    #[serde(default = "default_run_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub run_interval_secs: u64,
    /// Settle delay before the first allocation pass, giving chargers time
    /// to reconnect and boot-notify after a restart.
    #[serde(default = "default_first_wait_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub first_wait_secs: u64,
    #[serde(default = "default_intervals_full")]
    #[validate(range(min = 1))]
    pub intervals_full: u32,
    #[serde(default = "default_min_allocation_a")]
    pub min_allocation_a: u32,
    #[serde(default = "default_max_offer_increase_a")]
    pub max_offer_increase_a: u32,
    #[serde(default = "default_min_offer_increase_interval_secs")]
    pub min_offer_increase_interval_secs: i64,
    #[serde(default = "default_wait_after_reduce_secs")]
    pub wait_after_reduce_secs: i64,
    #[serde(default = "default_usage_monitoring_interval_secs")]
    pub usage_monitoring_interval_secs: i64,
    #[serde(default = "default_margin_lower_a")]
    pub margin_lower_a: f64,
    #[serde(default = "default_usage_threshold_a")]
    pub usage_threshold_a: f64,
    #[serde(default = "default_suspended_allocation_timeout_secs")]
    pub suspended_allocation_timeout_secs: i64,
    #[serde(default = "default_suspended_delayed_time_secs")]
    pub suspended_delayed_time_secs: i64,
    #[serde(default = "default_suspended_delayed_time_not_first_secs")]
    pub suspended_delayed_time_not_first_secs: i64,
    #[serde(default = "default_energy_threshold_wh")]
    pub energy_threshold_wh: f64,
    #[serde(default)]
    pub suspend_top_of_hour: bool,
    /// Fallback session priority when neither the session's group nor its
    /// charger carries a more specific default.
    #[serde(default = "default_priority")]
    pub default_priority: i32,
}

impl Default for BalanzConfig {
    fn default() -> Self {
        Self {
            run_interval_secs: default_run_interval_secs(),
            first_wait_secs: default_first_wait_secs(),
            intervals_full: default_intervals_full(),
            min_allocation_a: default_min_allocation_a(),
            max_offer_increase_a: default_max_offer_increase_a(),
            min_offer_increase_interval_secs: default_min_offer_increase_interval_secs(),
            wait_after_reduce_secs: default_wait_after_reduce_secs(),
            usage_monitoring_interval_secs: default_usage_monitoring_interval_secs(),
            margin_lower_a: default_margin_lower_a(),
            usage_threshold_a: default_usage_threshold_a(),
            suspended_allocation_timeout_secs: default_suspended_allocation_timeout_secs(),
            suspended_delayed_time_secs: default_suspended_delayed_time_secs(),
            suspended_delayed_time_not_first_secs: default_suspended_delayed_time_not_first_secs(),
            energy_threshold_wh: default_energy_threshold_wh(),
            suspend_top_of_hour: false,
            default_priority: default_priority(),
        }
    }
}

impl BalanzConfig {
    pub fn to_allocator_config(&self) -> crate::allocator::algorithm::AllocatorConfig {
        crate::allocator::algorithm::AllocatorConfig {
            min_allocation_a: self.min_allocation_a,
            max_offer_increase_a: self.max_offer_increase_a,
            min_offer_increase_interval: chrono::Duration::seconds(self.min_offer_increase_interval_secs),
            wait_after_reduce: chrono::Duration::seconds(self.wait_after_reduce_secs),
            usage_monitoring_interval: chrono::Duration::seconds(self.usage_monitoring_interval_secs),
            margin_lower_a: self.margin_lower_a,
            usage_threshold_a: self.usage_threshold_a,
            suspended_allocation_timeout: chrono::Duration::seconds(self.suspended_allocation_timeout_secs),
            suspended_delayed_time: chrono::Duration::seconds(self.suspended_delayed_time_secs),
            suspended_delayed_time_not_first: chrono::Duration::seconds(self.suspended_delayed_time_not_first_secs),
            energy_threshold_wh: self.energy_threshold_wh,
            suspend_top_of_hour: self.suspend_top_of_hour,
        }
    }
}

/// CSV-backed data model file locations (spec §3, §6).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ModelConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

impl ModelConfig {
    pub fn groups_csv(&self) -> PathBuf {
        self.data_dir.join("groups.csv")
    }
    pub fn chargers_csv(&self) -> PathBuf {
        self.data_dir.join("chargers.csv")
    }
    pub fn tags_csv(&self) -> PathBuf {
        self.data_dir.join("tags.csv")
    }
    pub fn users_csv(&self) -> PathBuf {
        self.data_dir.join("users.csv")
    }
    pub fn firmware_csv(&self) -> PathBuf {
        self.data_dir.join("firmware.csv")
    }
}

/// Append-only session history and audit log locations (spec §6).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct HistoryConfig {
    #[serde(default = "default_sessions_csv")]
    pub sessions_csv: PathBuf,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { sessions_csv: default_sessions_csv(), audit_log: default_audit_log() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_boot_interval_secs() -> u32 {
    300
}
fn default_watchdog_stale_secs() -> u64 {
    500
}
fn default_transaction_timeout_secs() -> u64 {
    3600
}
fn default_call_timeout_ms() -> u64 {
    30_000
}
fn default_run_interval_secs() -> u64 {
    5
}
fn default_first_wait_secs() -> u64 {
    20
}
fn default_priority() -> i32 {
    0
}
fn default_intervals_full() -> u32 {
    12
}
fn default_min_allocation_a() -> u32 {
    6
}
fn default_max_offer_increase_a() -> u32 {
    3
}
fn default_min_offer_increase_interval_secs() -> i64 {
    115
}
fn default_wait_after_reduce_secs() -> i64 {
    5
}
fn default_usage_monitoring_interval_secs() -> i64 {
    300
}
fn default_margin_lower_a() -> f64 {
    0.8
}
fn default_usage_threshold_a() -> f64 {
    2.0
}
fn default_suspended_allocation_timeout_secs() -> i64 {
    300
}
fn default_suspended_delayed_time_secs() -> i64 {
    300
}
fn default_suspended_delayed_time_not_first_secs() -> i64 {
    60
}
fn default_energy_threshold_wh() -> f64 {
    1000.0
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_sessions_csv() -> PathBuf {
    PathBuf::from("data/sessions.csv")
}
fn default_audit_log() -> PathBuf {
    PathBuf::from("data/audit_log.txt")
}

impl AppConfig {
    /// Loads `config/default.toml`, then `config/local.toml` if present,
    /// then `OCPP__`-prefixed environment variables (`OCPP__BALANZ__MIN_ALLOCATION_A`
    /// → `balanz.min_allocation_a`), later sources overriding earlier ones.
    pub fn load() -> std::result::Result<Self, crate::error::ConfigError> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Toml::file("config/local.toml").nested())
            .merge(Env::prefixed("OCPP__").split("__"));

        let config: AppConfig = figment
            .extract()
            .context("failed to parse configuration")
            .map_err(crate::error::ConfigError::Load)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balanz_defaults_match_documented_values() {
        let cfg = BalanzConfig::default();
        assert_eq!(cfg.min_allocation_a, 6);
        assert_eq!(cfg.max_offer_increase_a, 3);
        assert_eq!(cfg.min_offer_increase_interval_secs, 115);
        assert_eq!(cfg.energy_threshold_wh, 1000.0);
    }

    #[test]
    fn host_config_builds_socket_addr() {
        let cfg = HostConfig { bind: "0.0.0.0".into(), port: 9000 };
        assert_eq!(cfg.socket_addr().unwrap().port(), 9000);
    }

    #[test]
    fn protocol_auth_requires_both_flags() {
        let mut cfg = ApiConfig::default();
        assert!(!cfg.protocol_auth_enabled());
        cfg.allow_protocol_auth = true;
        assert!(!cfg.protocol_auth_enabled());
        cfg.dev_mode = true;
        assert!(cfg.protocol_auth_enabled());
    }
}
