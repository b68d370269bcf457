//! Live migration of one account between store shards.
//!
//! The coordinator copies the account's keys while the source keeps serving Extend and
//! Release, re-copies keys those operations dirtied until the remaining delta is small,
//! pauses the account for one final sync, switches routing, and finally cleans up the
//! source. Acquire is deferred with a retry time for the whole migration.
//!
//! Submodules:
//! - `copier`: [`KeyCopier`] implementations
//! - `dirty`: [`DirtyKeyTracker`]

mod copier;
mod dirty;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::keys::KeyGenerator;
use crate::metrics::Metrics;
use crate::routing::SwitchRouting;
use crate::store::{KvClient, KvClientExt, StoreError};

pub use copier::{DumpRestoreCopier, KeyCopier, TypeAwareCopier};
pub use dirty::DirtyKeyTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MigrationPhase {
    Idle = 0,
    CopyingLeaseState = 1,
    ConvergingDelta = 2,
    FinalSync = 3,
    SwitchingRoute = 4,
    Cleanup = 5,
    Complete = 6,
    Failed = 7,
}

impl MigrationPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => MigrationPhase::Idle,
            1 => MigrationPhase::CopyingLeaseState,
            2 => MigrationPhase::ConvergingDelta,
            3 => MigrationPhase::FinalSync,
            4 => MigrationPhase::SwitchingRoute,
            5 => MigrationPhase::Cleanup,
            6 => MigrationPhase::Complete,
            _ => MigrationPhase::Failed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationPhase::Idle => "idle",
            MigrationPhase::CopyingLeaseState => "copying_lease_state",
            MigrationPhase::ConvergingDelta => "converging_delta",
            MigrationPhase::FinalSync => "final_sync",
            MigrationPhase::SwitchingRoute => "switching_route",
            MigrationPhase::Cleanup => "cleanup",
            MigrationPhase::Complete => "complete",
            MigrationPhase::Failed => "failed",
        }
    }

    /// Extend and Release are refused while paused.
    pub fn is_paused(self) -> bool {
        matches!(
            self,
            MigrationPhase::FinalSync | MigrationPhase::SwitchingRoute
        )
    }

    /// Whether requests for the account must still go through the migration.
    pub fn is_active(self) -> bool {
        (self as u8) < (MigrationPhase::Cleanup as u8)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    pub copy_batch_size: usize,
    pub scan_count: usize,
    /// A delta pass copying at most this many keys ends convergence
    pub delta_convergence_threshold: usize,
    pub max_delta_passes: usize,
    /// Offered to Acquire callers while the account is migrating
    pub retry_after: Duration,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            copy_batch_size: 500,
            scan_count: 1_000,
            delta_convergence_threshold: 200,
            max_delta_passes: 5,
            retry_after: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("routing switch failed: {0}")]
    SwitchRouting(String),
    #[error("migration for account {account_id} cannot run from phase {phase}")]
    NotRunnable {
        account_id: Uuid,
        phase: MigrationPhase,
    },
    #[error("account {0} is already migrating")]
    AlreadyMigrating(Uuid),
    #[error("unknown shard {0}")]
    UnknownShard(String),
    #[error("account {account_id} already lives on shard {shard}")]
    SameShard { account_id: Uuid, shard: String },
    #[error("could not route account: {0}")]
    Routing(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    pub account_id: Uuid,
    pub phase: MigrationPhase,
    pub keys_copied: usize,
    pub delta_passes: usize,
    pub delta_keys_copied: usize,
    pub final_sync_keys: usize,
    pub keys_cleaned: usize,
    pub duration: Duration,
    pub pause_duration: Duration,
    pub error: Option<String>,
}

impl MigrationResult {
    fn new(account_id: Uuid) -> Self {
        Self {
            account_id,
            phase: MigrationPhase::Idle,
            keys_copied: 0,
            delta_passes: 0,
            delta_keys_copied: 0,
            final_sync_keys: 0,
            keys_cleaned: 0,
            duration: Duration::ZERO,
            pause_duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.phase == MigrationPhase::Complete
    }
}

/// Held by an Extend or Release forwarded to the source shard. The final sync waits for
/// every guard to drop.
pub struct InFlightGuard {
    coordinator: Arc<MigrationCoordinator>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.coordinator.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.coordinator.drained.notify_waiters();
        }
    }
}

/// Endpoints of one migration.
#[derive(Clone)]
pub struct MigrationPlan {
    pub account_id: Uuid,
    pub source_shard: String,
    pub destination_shard: String,
    pub source: Arc<dyn KvClient>,
    pub destination: Arc<dyn KvClient>,
    pub keys: KeyGenerator,
}

pub struct MigrationCoordinator {
    plan: MigrationPlan,
    options: MigrationOptions,
    copier: Arc<dyn KeyCopier>,
    switch: Arc<dyn SwitchRouting>,
    tracker: DirtyKeyTracker,
    phase: AtomicU8,
    in_flight: AtomicUsize,
    drained: Notify,
    metrics: Option<Metrics>,
}

impl fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("account_id", &self.plan.account_id)
            .field("source", &self.plan.source_shard)
            .field("destination", &self.plan.destination_shard)
            .field("phase", &self.phase())
            .finish()
    }
}

impl MigrationCoordinator {
    pub fn new(
        plan: MigrationPlan,
        options: MigrationOptions,
        copier: Arc<dyn KeyCopier>,
        switch: Arc<dyn SwitchRouting>,
    ) -> Self {
        Self {
            plan,
            options,
            copier,
            switch,
            tracker: DirtyKeyTracker::new(),
            phase: AtomicU8::new(MigrationPhase::Idle as u8),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn account_id(&self) -> Uuid {
        self.plan.account_id
    }

    pub fn source_shard(&self) -> &str {
        &self.plan.source_shard
    }

    pub fn destination_shard(&self) -> &str {
        &self.plan.destination_shard
    }

    pub fn retry_after(&self) -> Duration {
        self.options.retry_after
    }

    pub fn tracker(&self) -> &DirtyKeyTracker {
        &self.tracker
    }

    pub fn phase(&self) -> MigrationPhase {
        MigrationPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn is_paused(&self) -> bool {
        self.phase().is_paused()
    }

    pub fn is_active(&self) -> bool {
        self.phase().is_active()
    }

    /// Registers a source-shard write. `None` once the account is paused.
    pub fn try_begin_op(self: &Arc<Self>) -> Option<InFlightGuard> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlightGuard {
            coordinator: self.clone(),
        };
        if self.is_paused() {
            return None;
        }
        Some(guard)
    }

    fn set_phase(&self, phase: MigrationPhase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    async fn wait_for_in_flight(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn scan(&self, client: &dyn KvClient) -> Result<BTreeSet<String>, StoreError> {
        let mut keys = BTreeSet::new();
        for pattern in self.plan.keys.account_patterns(self.plan.account_id) {
            keys.extend(client.scan_all(&pattern, self.options.scan_count).await?);
        }
        Ok(keys)
    }

    async fn copy(&self, keys: &BTreeSet<String>) -> Result<usize, StoreError> {
        let keys: Vec<String> = keys.iter().cloned().collect();
        self.copier
            .copy_keys(
                self.plan.source.as_ref(),
                self.plan.destination.as_ref(),
                &keys,
                self.options.copy_batch_size,
            )
            .await
    }

    async fn copy_scavenger_entry(&self) -> Result<(), StoreError> {
        let shard_key = self.plan.keys.scavenger_shard();
        let account = self.plan.account_id.to_string();
        match self.plan.source.zscore(&shard_key, &account).await? {
            Some(score) => {
                self.plan
                    .destination
                    .zadd(&shard_key, &account, score)
                    .await
            }
            None => self
                .plan
                .destination
                .zrem(&shard_key, &account)
                .await
                .map(|_| ()),
        }
    }

    /// Dirty keys plus a fresh scan of the source.
    async fn delta(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut keys = self.scan(self.plan.source.as_ref()).await?;
        keys.extend(self.tracker.drain_and_reset());
        Ok(keys)
    }

    fn record_phase(&self, phase: MigrationPhase, started: Instant) {
        if let Some(m) = &self.metrics {
            m.record_migration_phase(phase.as_str(), started.elapsed().as_secs_f64());
        }
    }

    /// Runs the migration to completion. Always returns a result; failures end in phase
    /// [`MigrationPhase::Failed`] with `error` set, leaving the source untouched.
    #[instrument(skip_all, fields(account_id = %self.plan.account_id, source = %self.plan.source_shard, destination = %self.plan.destination_shard))]
    pub async fn run(self: &Arc<Self>) -> MigrationResult {
        let started = Instant::now();
        let mut result = MigrationResult::new(self.plan.account_id);
        if self
            .phase
            .compare_exchange(
                MigrationPhase::Idle as u8,
                MigrationPhase::CopyingLeaseState as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            let phase = self.phase();
            result.phase = phase;
            result.error = Some(
                MigrationError::NotRunnable {
                    account_id: self.plan.account_id,
                    phase,
                }
                .to_string(),
            );
            return result;
        }

        let mut pause_started = None;
        let outcome = self.run_phases(&mut result, &mut pause_started).await;
        if let Some(paused) = pause_started {
            result.pause_duration = paused.elapsed();
        }
        result.duration = started.elapsed();
        match outcome {
            Ok(()) => {
                self.set_phase(MigrationPhase::Complete);
                info!(
                    keys_copied = result.keys_copied,
                    delta_passes = result.delta_passes,
                    pause_ms = result.pause_duration.as_millis() as u64,
                    "account migration complete"
                );
                if let Some(m) = &self.metrics {
                    m.record_migration("complete");
                }
            }
            Err(e) => {
                self.set_phase(MigrationPhase::Failed);
                warn!(error = %e, "account migration failed");
                result.error = Some(e.to_string());
                if let Some(m) = &self.metrics {
                    m.record_migration("failed");
                }
            }
        }
        result.phase = self.phase();
        result
    }

    async fn run_phases(
        &self,
        result: &mut MigrationResult,
        pause_started: &mut Option<Instant>,
    ) -> Result<(), MigrationError> {
        let phase_started = Instant::now();
        let initial = self.scan(self.plan.source.as_ref()).await?;
        result.keys_copied = self.copy(&initial).await?;
        self.copy_scavenger_entry().await?;
        self.record_phase(MigrationPhase::CopyingLeaseState, phase_started);

        self.set_phase(MigrationPhase::ConvergingDelta);
        let phase_started = Instant::now();
        while result.delta_passes < self.options.max_delta_passes {
            let delta = self.delta().await?;
            result.delta_keys_copied += self.copy(&delta).await?;
            result.delta_passes += 1;
            if delta.len() <= self.options.delta_convergence_threshold {
                break;
            }
        }
        self.record_phase(MigrationPhase::ConvergingDelta, phase_started);

        self.set_phase(MigrationPhase::FinalSync);
        *pause_started = Some(Instant::now());
        let phase_started = Instant::now();
        self.wait_for_in_flight().await;
        let delta = self.delta().await?;
        result.final_sync_keys = self.copy(&delta).await?;
        let source_keys = self.scan(self.plan.source.as_ref()).await?;
        let stale: Vec<String> = self
            .scan(self.plan.destination.as_ref())
            .await?
            .difference(&source_keys)
            .cloned()
            .collect();
        self.plan.destination.del(stale).await?;
        self.copy_scavenger_entry().await?;
        self.record_phase(MigrationPhase::FinalSync, phase_started);

        self.set_phase(MigrationPhase::SwitchingRoute);
        self.switch
            .switch(self.plan.account_id)
            .await
            .map_err(|e| MigrationError::SwitchRouting(format!("{e:#}")))?;

        self.set_phase(MigrationPhase::Cleanup);
        if let Some(paused) = pause_started.take() {
            result.pause_duration = paused.elapsed();
        }
        let phase_started = Instant::now();
        let leftovers: Vec<String> = self
            .scan(self.plan.source.as_ref())
            .await?
            .into_iter()
            .collect();
        for batch in leftovers.chunks(self.options.copy_batch_size.max(1)) {
            result.keys_cleaned += self.plan.source.del(batch.to_vec()).await? as usize;
        }
        self.plan
            .source
            .zrem(
                &self.plan.keys.scavenger_shard(),
                &self.plan.account_id.to_string(),
            )
            .await?;
        self.record_phase(MigrationPhase::Cleanup, phase_started);
        Ok(())
    }
}
