//! Per-shard capacity manager.
//!
//! Every mutating operation is one atomic script against the shard's store. The module is
//! split by operation:
//! - `acquire`: lease grants across all constraints
//! - `check`: read-only evaluation
//! - `extend`: lease renewal under a new lease ID
//! - `release`: lease removal
//! - `scavenge`: reclaiming expired leases
//! - `evaluate`: constraint evaluation and lease bookkeeping shared by the scripts
//! - `gcra`: rate-limit and throttle arithmetic

mod acquire;
mod check;
mod evaluate;
mod extend;
mod gcra;
mod release;
mod scavenge;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::cache::AcquireResponseCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{CapacityError, ConfigError, InternalError};
use crate::keys::KeyGenerator;
use crate::lifecycle::Lifecycles;
use crate::metrics::Metrics;
use crate::request::{
    AcquireRequest, AcquireResponse, CheckRequest, CheckResponse, ExtendLeaseRequest,
    ExtendLeaseResponse, ReleaseRequest, ReleaseResponse,
};
use crate::scavenger::ScavengerOptions;
use crate::store::{KvClient, KvClientExt, Script, StoreError};

/// The capacity API shared by the shard manager, the routing manager and cache wrappers.
#[async_trait]
pub trait CapacityManager: Send + Sync {
    async fn acquire(&self, req: &AcquireRequest) -> Result<AcquireResponse, CapacityError>;
    async fn check(&self, req: &CheckRequest) -> Result<CheckResponse, CapacityError>;
    async fn extend_lease(
        &self,
        req: &ExtendLeaseRequest,
    ) -> Result<ExtendLeaseResponse, CapacityError>;
    async fn release(&self, req: &ReleaseRequest) -> Result<ReleaseResponse, CapacityError>;
}

/// Construction options for [`ShardCapacityManager`].
#[derive(Debug, Clone)]
pub struct CapacityManagerConfig {
    pub shard_name: String,
    pub client: Arc<dyn KvClient>,
    pub clock: Arc<dyn Clock>,
    pub keys: KeyGenerator,
    pub enable_debug_logs: bool,
    pub enable_high_cardinality_metrics: bool,
    pub operation_idempotency_ttl: Duration,
    pub check_idempotency_ttl: Duration,
    pub constraint_check_idempotency_ttl: Duration,
    pub max_allowed_request_delay: Duration,
    pub lifecycles: Lifecycles,
    /// Zero disables the acquire response cache
    pub acquire_response_cache_ttl: Duration,
    pub scavenger: ScavengerOptions,
    pub script_timeout: Duration,
    pub metrics: Option<Metrics>,
}

impl CapacityManagerConfig {
    pub fn new(shard_name: impl Into<String>, client: Arc<dyn KvClient>) -> Self {
        Self {
            shard_name: shard_name.into(),
            client,
            clock: Arc::new(SystemClock),
            keys: KeyGenerator::default(),
            enable_debug_logs: false,
            enable_high_cardinality_metrics: false,
            operation_idempotency_ttl: Duration::from_secs(5),
            check_idempotency_ttl: Duration::from_secs(1),
            constraint_check_idempotency_ttl: Duration::from_secs(10),
            max_allowed_request_delay: Duration::from_secs(5),
            lifecycles: Lifecycles::default(),
            acquire_response_cache_ttl: Duration::ZERO,
            scavenger: ScavengerOptions::default(),
            script_timeout: Duration::from_secs(2),
            metrics: None,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.shard_name.is_empty() {
            return Err(ConfigError::Missing("shard_name"));
        }
        if self.keys.prefix().is_empty() {
            return Err(ConfigError::Invalid {
                name: "keys",
                reason: "key prefix must not be empty".to_string(),
            });
        }
        if self.operation_idempotency_ttl.is_zero() {
            return Err(ConfigError::Invalid {
                name: "operation_idempotency_ttl",
                reason: "must be positive".to_string(),
            });
        }
        if self.script_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "script_timeout",
                reason: "must be positive".to_string(),
            });
        }
        if self.scavenger.concurrency == 0
            || self.scavenger.accounts_peek_size == 0
            || self.scavenger.leases_peek_size == 0
        {
            return Err(ConfigError::Invalid {
                name: "scavenger",
                reason: "peek sizes and concurrency must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Capacity manager for one store shard.
pub struct ShardCapacityManager {
    pub(crate) name: String,
    pub(crate) client: Arc<dyn KvClient>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) keys: KeyGenerator,
    pub(crate) debug_logs: bool,
    pub(crate) high_cardinality_metrics: bool,
    pub(crate) operation_idempotency_ttl: Duration,
    pub(crate) check_idempotency_ttl: Duration,
    pub(crate) constraint_check_idempotency_ttl: Duration,
    pub(crate) max_allowed_request_delay: Duration,
    pub(crate) lifecycles: Lifecycles,
    pub(crate) acquire_cache: Option<AcquireResponseCache>,
    pub(crate) scavenger: ScavengerOptions,
    pub(crate) script_timeout: Duration,
    pub(crate) metrics: Option<Metrics>,
}

impl std::fmt::Debug for ShardCapacityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardCapacityManager")
            .field("name", &self.name)
            .field("prefix", &self.keys.prefix())
            .finish_non_exhaustive()
    }
}

impl ShardCapacityManager {
    pub fn new(config: CapacityManagerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let acquire_cache =
            AcquireResponseCache::new(config.acquire_response_cache_ttl, config.clock.clone());
        Ok(Self {
            name: config.shard_name,
            client: config.client,
            clock: config.clock,
            keys: config.keys,
            debug_logs: config.enable_debug_logs,
            high_cardinality_metrics: config.enable_high_cardinality_metrics,
            operation_idempotency_ttl: config.operation_idempotency_ttl,
            check_idempotency_ttl: config.check_idempotency_ttl,
            constraint_check_idempotency_ttl: config.constraint_check_idempotency_ttl,
            max_allowed_request_delay: config.max_allowed_request_delay,
            lifecycles: config.lifecycles,
            acquire_cache,
            scavenger: config.scavenger,
            script_timeout: config.script_timeout,
            metrics: config.metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<dyn KvClient> {
        &self.client
    }

    pub fn keys(&self) -> &KeyGenerator {
        &self.keys
    }

    /// Whether Acquire recently granted a lease for `lease_idempotency_key`, within the
    /// constraint-check idempotency TTL. Callers use it to skip a redundant Check.
    pub async fn constraint_check_idempotent(
        &self,
        account_id: Uuid,
        lease_idempotency_key: &str,
    ) -> Result<bool, InternalError> {
        let key = self
            .keys
            .constraint_check_idempotency(account_id, lease_idempotency_key);
        Ok(self.with_timeout(self.client.exists(&key)).await?)
    }

    pub(crate) async fn with_timeout<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: std::future::Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.script_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::Timeout(self.script_timeout)),
        }
    }

    /// Evaluate a script and decode its JSON reply, recording latency and outcome.
    pub(crate) async fn run_script<R: DeserializeOwned>(
        &self,
        operation: &'static str,
        script: &dyn Script,
    ) -> Result<R, InternalError> {
        let start = Instant::now();
        let raw = self.with_timeout(self.client.eval(script)).await;
        let elapsed = start.elapsed().as_secs_f64();
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.record_script(&self.name, operation, "error", elapsed);
                }
                debug!(shard = %self.name, operation, error = %e, "script failed");
                return Err(e.into());
            }
        };
        if let Some(m) = &self.metrics {
            m.record_script(&self.name, operation, "ok", elapsed);
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    pub(crate) fn log_debug_lines(
        &self,
        operation: &'static str,
        account_id: Uuid,
        lines: &[String],
    ) {
        if !self.debug_logs {
            return;
        }
        for line in lines {
            debug!(shard = %self.name, operation, account_id = %account_id, "{}", line);
        }
    }

    pub(crate) fn record_leases(&self, account_id: Uuid, event: &str, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(m) = &self.metrics {
            m.record_leases(&self.name, event, count as u64);
            if self.high_cardinality_metrics {
                m.record_account_leases(&self.name, &account_id.to_string(), event, count as u64);
            }
        }
    }
}

#[async_trait]
impl CapacityManager for ShardCapacityManager {
    async fn acquire(&self, req: &AcquireRequest) -> Result<AcquireResponse, CapacityError> {
        ShardCapacityManager::acquire(self, req).await
    }

    async fn check(&self, req: &CheckRequest) -> Result<CheckResponse, CapacityError> {
        ShardCapacityManager::check(self, req).await
    }

    async fn extend_lease(
        &self,
        req: &ExtendLeaseRequest,
    ) -> Result<ExtendLeaseResponse, CapacityError> {
        ShardCapacityManager::extend_lease(self, req).await
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<ReleaseResponse, CapacityError> {
        ShardCapacityManager::release(self, req).await
    }
}

#[async_trait]
impl<T: CapacityManager + ?Sized> CapacityManager for Arc<T> {
    async fn acquire(&self, req: &AcquireRequest) -> Result<AcquireResponse, CapacityError> {
        (**self).acquire(req).await
    }

    async fn check(&self, req: &CheckRequest) -> Result<CheckResponse, CapacityError> {
        (**self).check(req).await
    }

    async fn extend_lease(
        &self,
        req: &ExtendLeaseRequest,
    ) -> Result<ExtendLeaseResponse, CapacityError> {
        (**self).extend_lease(req).await
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<ReleaseResponse, CapacityError> {
        (**self).release(req).await
    }
}
