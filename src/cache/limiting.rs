use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::capacity::CapacityManager;
use crate::clock::{duration_ms, Clock};
use crate::constraint::{ConstraintItem, ConstraintKind};
use crate::error::CapacityError;
use crate::metrics::Metrics;
use crate::request::{
    AcquireRequest, AcquireResponse, CheckRequest, CheckResponse, ExtendLeaseRequest,
    ExtendLeaseResponse, ReleaseRequest, ReleaseResponse,
};

const MIN_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct LimitingCacheOptions {
    pub max_entries: usize,
    /// Entries evicted, least recently used first, once `max_entries` is reached
    pub prune_count: usize,
    /// Fixed TTL per constraint kind instead of the response's retry time
    pub ttl_overrides: HashMap<ConstraintKind, Duration>,
}

impl Default for LimitingCacheOptions {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            prune_count: 500,
            ttl_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    retry_after_ms: i64,
    expires_at_ms: i64,
}

/// Remembers constraints that denied an Acquire outright and answers later Acquires
/// naming any of them without contacting the inner manager.
pub struct LimitingConstraintCache<M> {
    inner: M,
    clock: Arc<dyn Clock>,
    options: LimitingCacheOptions,
    entries: Mutex<LruCache<String, Entry>>,
    metrics: Option<Metrics>,
}

impl<M: CapacityManager> LimitingConstraintCache<M> {
    pub fn new(inner: M, clock: Arc<dyn Clock>, options: LimitingCacheOptions) -> Self {
        Self {
            inner,
            clock,
            options,
            entries: Mutex::new(LruCache::unbounded()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &M {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Constraints of `req` still cached as limiting, with the latest retry time among them.
    fn lookup(&self, req: &AcquireRequest, now_ms: i64) -> (Vec<ConstraintItem>, i64) {
        let mut entries = self.entries.lock();
        let mut hits = Vec::new();
        let mut retry_after_ms = 0;
        for item in &req.constraints {
            let key = item.cache_key(req.account_id, req.env_id, req.function_id);
            match entries.get(&key).copied() {
                Some(entry) if entry.expires_at_ms > now_ms => {
                    retry_after_ms = retry_after_ms.max(entry.retry_after_ms);
                    hits.push(item.clone());
                }
                Some(_) => {
                    entries.pop(&key);
                }
                None => {}
            }
        }
        (hits, retry_after_ms)
    }

    fn remember(&self, req: &AcquireRequest, resp: &AcquireResponse, now_ms: i64) {
        let mut entries = self.entries.lock();
        for item in &resp.limiting_constraints {
            let ttl_ms = match self.options.ttl_overrides.get(&item.kind()) {
                Some(ttl) => duration_ms(*ttl),
                None => (resp.retry_after_ms - now_ms).max(duration_ms(MIN_TTL)),
            };
            if entries.len() >= self.options.max_entries {
                for _ in 0..self.options.prune_count.max(1) {
                    if entries.pop_lru().is_none() {
                        break;
                    }
                }
            }
            entries.put(
                item.cache_key(req.account_id, req.env_id, req.function_id),
                Entry {
                    retry_after_ms: resp.retry_after_ms,
                    expires_at_ms: now_ms + ttl_ms,
                },
            );
        }
    }
}

#[async_trait]
impl<M: CapacityManager> CapacityManager for LimitingConstraintCache<M> {
    async fn acquire(&self, req: &AcquireRequest) -> Result<AcquireResponse, CapacityError> {
        let now_ms = self.clock.now_ms();
        let (hits, retry_after_ms) = self.lookup(req, now_ms);
        if !hits.is_empty() {
            if let Some(m) = &self.metrics {
                m.record_cache_hit("limiting_constraint");
            }
            debug!(account_id = %req.account_id, hits = hits.len(), "limiting constraint cache hit");
            let mut resp = AcquireResponse::retry_at(retry_after_ms);
            resp.limiting_constraints = hits;
            return Ok(resp);
        }

        let resp = self.inner.acquire(req).await?;
        if resp.leases.is_empty() && !resp.limiting_constraints.is_empty() {
            self.remember(req, &resp, now_ms);
        }
        Ok(resp)
    }

    async fn check(&self, req: &CheckRequest) -> Result<CheckResponse, CapacityError> {
        self.inner.check(req).await
    }

    async fn extend_lease(
        &self,
        req: &ExtendLeaseRequest,
    ) -> Result<ExtendLeaseResponse, CapacityError> {
        self.inner.extend_lease(req).await
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<ReleaseResponse, CapacityError> {
        self.inner.release(req).await
    }
}
