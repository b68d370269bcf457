use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::LimitingCacheOptions;
use crate::capacity::CapacityManagerConfig;
use crate::clock::Clock;
use crate::keys::{KeyGenerator, DEFAULT_KEY_PREFIX};
use crate::migration::MigrationOptions;
use crate::scavenger::ScavengerOptions;
use crate::store::KvClient;

/// Log output format
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Startup configuration for one process. Durations are milliseconds.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Prefix for rate-limit and throttle cells; `key_prefix` when unset
    #[serde(default)]
    pub rate_limit_key_prefix: Option<String>,
    #[serde(default = "default_operation_idempotency_ttl_ms")]
    pub operation_idempotency_ttl_ms: u64,
    #[serde(default = "default_check_idempotency_ttl_ms")]
    pub check_idempotency_ttl_ms: u64,
    #[serde(default = "default_constraint_check_idempotency_ttl_ms")]
    pub constraint_check_idempotency_ttl_ms: u64,
    #[serde(default = "default_max_allowed_request_delay_ms")]
    pub max_allowed_request_delay_ms: u64,
    /// 0 disables the acquire response cache
    #[serde(default)]
    pub acquire_response_cache_ttl_ms: u64,
    #[serde(default)]
    pub enable_debug_logs: bool,
    #[serde(default)]
    pub enable_high_cardinality_metrics: bool,
    #[serde(default = "default_script_timeout_ms")]
    pub script_timeout_ms: u64,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub scavenger: ScavengerSettings,
    #[serde(default)]
    pub migration: MigrationSettings,
    #[serde(default)]
    pub limiting_cache: LimitingCacheSettings,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ScavengerSettings {
    #[serde(default = "default_peek_size")]
    pub accounts_peek_size: usize,
    #[serde(default = "default_peek_size")]
    pub leases_peek_size: usize,
    #[serde(default = "default_peek_size")]
    pub concurrency: usize,
    #[serde(default = "default_scavenger_interval_ms")]
    pub interval_ms: u64,
}

impl Default for ScavengerSettings {
    fn default() -> Self {
        Self {
            accounts_peek_size: default_peek_size(),
            leases_peek_size: default_peek_size(),
            concurrency: default_peek_size(),
            interval_ms: default_scavenger_interval_ms(),
        }
    }
}

impl ScavengerSettings {
    pub fn options(&self) -> ScavengerOptions {
        ScavengerOptions {
            accounts_peek_size: self.accounts_peek_size,
            leases_peek_size: self.leases_peek_size,
            concurrency: self.concurrency,
            skip_account: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct MigrationSettings {
    #[serde(default = "default_copy_batch_size")]
    pub copy_batch_size: usize,
    #[serde(default = "default_scan_count")]
    pub scan_count: usize,
    #[serde(default = "default_delta_convergence_threshold")]
    pub delta_convergence_threshold: usize,
    #[serde(default = "default_max_delta_passes")]
    pub max_delta_passes: usize,
    #[serde(default = "default_migration_retry_after_ms")]
    pub retry_after_ms: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            copy_batch_size: default_copy_batch_size(),
            scan_count: default_scan_count(),
            delta_convergence_threshold: default_delta_convergence_threshold(),
            max_delta_passes: default_max_delta_passes(),
            retry_after_ms: default_migration_retry_after_ms(),
        }
    }
}

impl MigrationSettings {
    pub fn options(&self) -> MigrationOptions {
        MigrationOptions {
            copy_batch_size: self.copy_batch_size,
            scan_count: self.scan_count,
            delta_convergence_threshold: self.delta_convergence_threshold,
            max_delta_passes: self.max_delta_passes,
            retry_after: Duration::from_millis(self.retry_after_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LimitingCacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_prune_count")]
    pub prune_count: usize,
}

impl Default for LimitingCacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: default_cache_max_entries(),
            prune_count: default_cache_prune_count(),
        }
    }
}

impl LimitingCacheSettings {
    /// Cache sizing. Whether to wrap the manager at all is decided by `enabled`.
    pub fn options(&self) -> LimitingCacheOptions {
        LimitingCacheOptions {
            max_entries: self.max_entries,
            prune_count: self.prune_count,
            ..LimitingCacheOptions::default()
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_operation_idempotency_ttl_ms() -> u64 {
    5_000
}

fn default_check_idempotency_ttl_ms() -> u64 {
    1_000
}

fn default_constraint_check_idempotency_ttl_ms() -> u64 {
    10_000
}

fn default_max_allowed_request_delay_ms() -> u64 {
    5_000
}

fn default_script_timeout_ms() -> u64 {
    2_000
}

fn default_peek_size() -> usize {
    20
}

fn default_scavenger_interval_ms() -> u64 {
    1_000
}

fn default_copy_batch_size() -> usize {
    500
}

fn default_scan_count() -> usize {
    1_000
}

fn default_delta_convergence_threshold() -> usize {
    200
}

fn default_max_delta_passes() -> usize {
    5
}

fn default_migration_retry_after_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_cache_prune_count() -> usize {
    500
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            rate_limit_key_prefix: None,
            operation_idempotency_ttl_ms: default_operation_idempotency_ttl_ms(),
            check_idempotency_ttl_ms: default_check_idempotency_ttl_ms(),
            constraint_check_idempotency_ttl_ms: default_constraint_check_idempotency_ttl_ms(),
            max_allowed_request_delay_ms: default_max_allowed_request_delay_ms(),
            acquire_response_cache_ttl_ms: 0,
            enable_debug_logs: false,
            enable_high_cardinality_metrics: false,
            script_timeout_ms: default_script_timeout_ms(),
            log_format: LogFormat::Text,
            scavenger: ScavengerSettings::default(),
            migration: MigrationSettings::default(),
            limiting_cache: LimitingCacheSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                Self::from_toml_str(&data)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(data: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(data)?;
        if cfg.key_prefix.is_empty() {
            anyhow::bail!("key_prefix must not be empty");
        }
        if cfg.rate_limit_key_prefix.as_deref() == Some("") {
            anyhow::bail!("rate_limit_key_prefix must not be empty when set");
        }
        Ok(cfg)
    }

    /// Manager configuration for one shard. Lifecycle hooks and metrics are attached by
    /// the caller.
    pub fn manager_config(
        &self,
        shard_name: impl Into<String>,
        client: Arc<dyn KvClient>,
        clock: Arc<dyn Clock>,
    ) -> CapacityManagerConfig {
        let mut config = CapacityManagerConfig::new(shard_name, client);
        config.clock = clock;
        config.keys = KeyGenerator::new(self.key_prefix.clone());
        if let Some(prefix) = &self.rate_limit_key_prefix {
            config.keys = config.keys.with_rate_limit_prefix(prefix.clone());
        }
        config.operation_idempotency_ttl = Duration::from_millis(self.operation_idempotency_ttl_ms);
        config.check_idempotency_ttl = Duration::from_millis(self.check_idempotency_ttl_ms);
        config.constraint_check_idempotency_ttl =
            Duration::from_millis(self.constraint_check_idempotency_ttl_ms);
        config.max_allowed_request_delay = Duration::from_millis(self.max_allowed_request_delay_ms);
        config.acquire_response_cache_ttl =
            Duration::from_millis(self.acquire_response_cache_ttl_ms);
        config.enable_debug_logs = self.enable_debug_logs;
        config.enable_high_cardinality_metrics = self.enable_high_cardinality_metrics;
        config.script_timeout = Duration::from_millis(self.script_timeout_ms);
        config.scavenger = self.scavenger.options();
        config
    }
}
