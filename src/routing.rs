//! Routing of accounts to store shards.
//!
//! Every account lives on exactly one shard. [`ShardRouter`] names that shard and
//! [`RoutingCapacityManager`] forwards each capacity call to the manager registered for
//! it. While an account migrates, calls are pinned to the migration's source shard:
//! - Acquire is deferred with a retry time without contacting either shard
//! - Check passes through until the migration pauses
//! - Extend and Release mark the keys they touch as dirty before they are forwarded, and
//!   fail with a retryable error while the migration is paused
//!
//! Calls routed before a migration registers are counted per account, and the migration
//! does not start copying until they have finished.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::capacity::{CapacityManager, ShardCapacityManager};
use crate::clock::{duration_ms, Clock};
use crate::constraint::concurrency_keys_from_request_state;
use crate::error::{CapacityError, InternalError};
use crate::metrics::Metrics;
use crate::migration::{
    KeyCopier, MigrationCoordinator, MigrationError, MigrationOptions, MigrationPlan,
    MigrationResult, TypeAwareCopier,
};
use crate::request::{
    AcquireRequest, AcquireResponse, CheckRequest, CheckResponse, ExtendLeaseRequest,
    ExtendLeaseResponse, ReleaseRequest, ReleaseResponse,
};
use crate::scavenger::{Scavenge, ScavengeResult, ScavengerOptions};
use crate::store::{KvClientExt, StoreError};

/// FNV-1a 32-bit hash
#[inline]
pub fn fnv1a32(data: &[u8]) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 2166136261;
    const FNV_PRIME: u32 = 16777619;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Names the shard that owns an account.
#[async_trait]
pub trait ShardRouter: Send + Sync {
    async fn route(&self, account_id: Uuid) -> Result<String, InternalError>;
}

/// Spreads accounts over a fixed shard list by hashing the account ID.
#[derive(Debug, Clone)]
pub struct HashRouter {
    shards: Vec<String>,
}

impl HashRouter {
    pub fn new(shards: Vec<String>) -> Self {
        Self { shards }
    }

    pub fn shard_for(&self, account_id: Uuid) -> Option<&str> {
        if self.shards.is_empty() {
            return None;
        }
        let idx = fnv1a32(account_id.as_bytes()) as usize % self.shards.len();
        Some(&self.shards[idx])
    }
}

#[async_trait]
impl ShardRouter for HashRouter {
    async fn route(&self, account_id: Uuid) -> Result<String, InternalError> {
        self.shard_for(account_id)
            .map(str::to_string)
            .ok_or_else(|| InternalError::fatal("no shards configured"))
    }
}

/// Explicit per-account assignments over a default shard.
#[derive(Debug)]
pub struct StaticRouter {
    default_shard: String,
    assignments: RwLock<HashMap<Uuid, String>>,
}

impl StaticRouter {
    pub fn new(default_shard: impl Into<String>) -> Self {
        Self {
            default_shard: default_shard.into(),
            assignments: RwLock::new(HashMap::new()),
        }
    }

    pub fn assign(&self, account_id: Uuid, shard: impl Into<String>) {
        self.assignments.write().insert(account_id, shard.into());
    }

    pub fn unassign(&self, account_id: Uuid) {
        self.assignments.write().remove(&account_id);
    }

    pub fn shard_for(&self, account_id: Uuid) -> String {
        self.assignments
            .read()
            .get(&account_id)
            .cloned()
            .unwrap_or_else(|| self.default_shard.clone())
    }
}

#[async_trait]
impl ShardRouter for StaticRouter {
    async fn route(&self, account_id: Uuid) -> Result<String, InternalError> {
        Ok(self.shard_for(account_id))
    }
}

/// Points an account at its new shard once a migration has synced it.
#[async_trait]
pub trait SwitchRouting: Send + Sync {
    async fn switch(&self, account_id: Uuid) -> anyhow::Result<()>;
}

/// Switches routing by assigning the account in a [`StaticRouter`].
#[derive(Debug, Clone)]
pub struct AssignRoute {
    router: Arc<StaticRouter>,
    destination: String,
}

impl AssignRoute {
    pub fn new(router: Arc<StaticRouter>, destination: impl Into<String>) -> Self {
        Self {
            router,
            destination: destination.into(),
        }
    }
}

#[async_trait]
impl SwitchRouting for AssignRoute {
    async fn switch(&self, account_id: Uuid) -> anyhow::Result<()> {
        self.router.assign(account_id, self.destination.clone());
        Ok(())
    }
}

type Migrations = Arc<RwLock<HashMap<Uuid, Arc<MigrationCoordinator>>>>;

/// Calls forwarded to an account's routed shard outside any migration.
#[derive(Default)]
struct DirectOps {
    counts: Mutex<HashMap<Uuid, usize>>,
    drained: Notify,
}

impl DirectOps {
    fn begin(self: &Arc<Self>, account_id: Uuid) -> DirectOpGuard {
        *self.counts.lock().entry(account_id).or_insert(0) += 1;
        DirectOpGuard {
            ops: self.clone(),
            account_id,
        }
    }

    fn in_flight(&self, account_id: Uuid) -> usize {
        self.counts.lock().get(&account_id).copied().unwrap_or(0)
    }

    async fn wait_idle(&self, account_id: Uuid) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight(account_id) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct DirectOpGuard {
    ops: Arc<DirectOps>,
    account_id: Uuid,
}

impl Drop for DirectOpGuard {
    fn drop(&mut self) {
        let drained = {
            let mut counts = self.ops.counts.lock();
            match counts.get_mut(&self.account_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    counts.remove(&self.account_id);
                    true
                }
                None => false,
            }
        };
        if drained {
            self.ops.drained.notify_waiters();
        }
    }
}

/// Where one call goes.
enum Route {
    Direct(Arc<ShardCapacityManager>, DirectOpGuard),
    Migrating(Arc<ShardCapacityManager>, Arc<MigrationCoordinator>),
}

/// Capacity manager over many shards.
pub struct RoutingCapacityManager {
    router: Arc<dyn ShardRouter>,
    clock: Arc<dyn Clock>,
    shards: RwLock<HashMap<String, Arc<ShardCapacityManager>>>,
    migrations: Migrations,
    direct_ops: Arc<DirectOps>,
    migration_options: MigrationOptions,
    copier: Arc<dyn KeyCopier>,
    metrics: Option<Metrics>,
}

impl RoutingCapacityManager {
    pub fn new(router: Arc<dyn ShardRouter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            router,
            clock,
            shards: RwLock::new(HashMap::new()),
            migrations: Arc::new(RwLock::new(HashMap::new())),
            direct_ops: Arc::new(DirectOps::default()),
            migration_options: MigrationOptions::default(),
            copier: Arc::new(TypeAwareCopier),
            metrics: None,
        }
    }

    pub fn with_migration_options(mut self, options: MigrationOptions) -> Self {
        self.migration_options = options;
        self
    }

    pub fn with_copier(mut self, copier: Arc<dyn KeyCopier>) -> Self {
        self.copier = copier;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register_shard(&self, manager: Arc<ShardCapacityManager>) {
        self.shards
            .write()
            .insert(manager.name().to_string(), manager);
    }

    pub fn shard(&self, name: &str) -> Option<Arc<ShardCapacityManager>> {
        self.shards.read().get(name).cloned()
    }

    /// The account's migration, while it still affects routing.
    pub fn migration(&self, account_id: Uuid) -> Option<Arc<MigrationCoordinator>> {
        self.migrations
            .read()
            .get(&account_id)
            .filter(|m| m.is_active())
            .cloned()
    }

    /// Calls currently forwarded to `account_id`'s routed shard outside a migration.
    pub fn direct_ops_in_flight(&self, account_id: Uuid) -> usize {
        self.direct_ops.in_flight(account_id)
    }

    async fn route(&self, account_id: Uuid) -> Result<Route, CapacityError> {
        // Registered under the migrations read lock: start_migration inserts under the
        // write lock, so it sees every direct call that missed its coordinator.
        let guard = {
            let migrations = self.migrations.read();
            match migrations.get(&account_id).filter(|m| m.is_active()) {
                Some(migration) => Err(migration.clone()),
                None => Ok(self.direct_ops.begin(account_id)),
            }
        };
        let guard = match guard {
            Ok(guard) => guard,
            Err(migration) => {
                let shard = self.shard(migration.source_shard()).ok_or_else(|| {
                    InternalError::fatal(format!(
                        "migration source shard {} is not registered",
                        migration.source_shard()
                    ))
                })?;
                return Ok(Route::Migrating(shard, migration));
            }
        };
        let name = self.router.route(account_id).await?;
        let shard = self
            .shard(&name)
            .ok_or_else(|| InternalError::fatal(format!("shard {name} is not registered")))?;
        Ok(Route::Direct(shard, guard))
    }

    fn retry_at(&self, migration: &MigrationCoordinator) -> i64 {
        self.clock.now_ms() + duration_ms(migration.retry_after())
    }

    /// Marks the keys an Extend or Release of `lease_id` may write.
    async fn mark_lease_keys(
        &self,
        shard: &ShardCapacityManager,
        migration: &MigrationCoordinator,
        account_id: Uuid,
        lease_id: Ulid,
        operation_key: String,
    ) -> Result<(), StoreError> {
        let keys = shard.keys();
        let details_key = keys.lease_details(account_id, &lease_id.to_string());
        let mut dirty = vec![
            keys.account_leases(account_id),
            details_key.clone(),
            operation_key,
        ];
        let details = shard.client().hgetall(&details_key).await?;
        if let Some(ilks) = details.get("ilks") {
            match serde_json::from_str::<Vec<String>>(ilks) {
                Ok(ilks) => dirty.extend(ilks),
                Err(e) => warn!(error = %e, "unreadable in-progress keys in lease details"),
            }
        }
        if let Some(request_id) = details.get("req") {
            let state_key = keys.request_state(account_id, request_id);
            if let Some(raw) = shard.client().get(&state_key).await? {
                match concurrency_keys_from_request_state(&raw) {
                    Ok(found) => dirty.extend(found),
                    Err(e) => warn!(error = %e, "unreadable request state"),
                }
            }
            dirty.push(state_key);
        }
        migration.tracker().mark_dirty(dirty);
        Ok(())
    }

    fn paused_error() -> CapacityError {
        InternalError::retryable("account is migrating, retry shortly").into()
    }

    /// Registers a migration of `account_id` from its current shard to `destination`.
    /// Requests for the account take the migration path from now on; returns once the
    /// calls routed before registration have finished.
    pub async fn start_migration(
        &self,
        account_id: Uuid,
        destination: &str,
        switch: Arc<dyn SwitchRouting>,
    ) -> Result<Arc<MigrationCoordinator>, MigrationError> {
        let source_name = self
            .router
            .route(account_id)
            .await
            .map_err(|e| MigrationError::Routing(e.to_string()))?;
        if source_name == destination {
            return Err(MigrationError::SameShard {
                account_id,
                shard: source_name,
            });
        }
        let source = self
            .shard(&source_name)
            .ok_or_else(|| MigrationError::UnknownShard(source_name.clone()))?;
        let dest = self
            .shard(destination)
            .ok_or_else(|| MigrationError::UnknownShard(destination.to_string()))?;

        let coordinator = {
            let mut migrations = self.migrations.write();
            if migrations.get(&account_id).is_some_and(|m| m.is_active()) {
                return Err(MigrationError::AlreadyMigrating(account_id));
            }
            let plan = MigrationPlan {
                account_id,
                source_shard: source_name,
                destination_shard: destination.to_string(),
                source: source.client().clone(),
                destination: dest.client().clone(),
                keys: source.keys().clone(),
            };
            let mut coordinator = MigrationCoordinator::new(
                plan,
                self.migration_options.clone(),
                self.copier.clone(),
                switch,
            );
            if let Some(m) = &self.metrics {
                coordinator = coordinator.with_metrics(m.clone());
            }
            let coordinator = Arc::new(coordinator);
            migrations.insert(account_id, coordinator.clone());
            drop(migrations);
            coordinator
        };

        if self.direct_ops.in_flight(account_id) > 0 {
            debug!(account_id = %account_id, "waiting for routed calls before migrating");
        }
        self.direct_ops.wait_idle(account_id).await;
        Ok(coordinator)
    }

    pub fn finish_migration(&self, account_id: Uuid) -> Option<Arc<MigrationCoordinator>> {
        self.migrations.write().remove(&account_id)
    }

    /// Starts, runs and unregisters a migration.
    pub async fn migrate_account(
        &self,
        account_id: Uuid,
        destination: &str,
        switch: Arc<dyn SwitchRouting>,
    ) -> Result<MigrationResult, MigrationError> {
        let coordinator = self
            .start_migration(account_id, destination, switch)
            .await?;
        let result = coordinator.run().await;
        self.finish_migration(account_id);
        Ok(result)
    }
}

#[async_trait]
impl CapacityManager for RoutingCapacityManager {
    async fn acquire(&self, req: &AcquireRequest) -> Result<AcquireResponse, CapacityError> {
        match self.route(req.account_id).await? {
            Route::Direct(shard, _guard) => shard.acquire(req).await,
            Route::Migrating(_, migration) => {
                debug!(account_id = %req.account_id, phase = %migration.phase(), "deferring acquire during migration");
                Ok(AcquireResponse::retry_at(self.retry_at(&migration)))
            }
        }
    }

    async fn check(&self, req: &CheckRequest) -> Result<CheckResponse, CapacityError> {
        match self.route(req.account_id).await? {
            Route::Direct(shard, _guard) => shard.check(req).await,
            Route::Migrating(_, migration) if migration.is_paused() => {
                Ok(CheckResponse::retry_at(self.retry_at(&migration)))
            }
            Route::Migrating(shard, _) => shard.check(req).await,
        }
    }

    async fn extend_lease(
        &self,
        req: &ExtendLeaseRequest,
    ) -> Result<ExtendLeaseResponse, CapacityError> {
        let (shard, migration) = match self.route(req.account_id).await? {
            Route::Direct(shard, _guard) => return shard.extend_lease(req).await,
            Route::Migrating(shard, migration) => (shard, migration),
        };
        let Some(_guard) = migration.try_begin_op() else {
            return Err(Self::paused_error());
        };
        let operation_key =
            shard
                .keys()
                .operation_idempotency(req.account_id, "ext", &req.idempotency_key);
        if let Err(e) = self
            .mark_lease_keys(
                &shard,
                &migration,
                req.account_id,
                req.lease_id,
                operation_key,
            )
            .await
        {
            warn!(account_id = %req.account_id, error = %e, "could not mark extend keys dirty");
        }
        let resp = shard.extend_lease(req).await?;
        if let Some(new_id) = resp.lease_id {
            migration.tracker().mark_dirty([shard
                .keys()
                .lease_details(req.account_id, &new_id.to_string())]);
        }
        Ok(resp)
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<ReleaseResponse, CapacityError> {
        let (shard, migration) = match self.route(req.account_id).await? {
            Route::Direct(shard, _guard) => return shard.release(req).await,
            Route::Migrating(shard, migration) => (shard, migration),
        };
        let Some(_guard) = migration.try_begin_op() else {
            return Err(Self::paused_error());
        };
        let operation_key =
            shard
                .keys()
                .operation_idempotency(req.account_id, "rel", &req.idempotency_key);
        if let Err(e) = self
            .mark_lease_keys(
                &shard,
                &migration,
                req.account_id,
                req.lease_id,
                operation_key,
            )
            .await
        {
            warn!(account_id = %req.account_id, error = %e, "could not mark release keys dirty");
        }
        shard.release(req).await
    }
}

#[async_trait]
impl Scavenge for RoutingCapacityManager {
    /// Scavenges every shard, skipping accounts that are migrating.
    async fn scavenge(&self, options: &ScavengerOptions) -> Result<ScavengeResult, CapacityError> {
        let migrations = self.migrations.clone();
        let options = options.clone().also_skip(Arc::new(move |account| {
            migrations
                .read()
                .get(&account)
                .is_some_and(|m| m.is_active())
        }));
        let shards: Vec<Arc<ShardCapacityManager>> = self.shards.read().values().cloned().collect();
        let results = try_join_all(shards.iter().map(|shard| shard.scavenge(&options))).await?;
        Ok(results.into_iter().sum())
    }
}
