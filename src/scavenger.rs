//! Periodic reclamation of expired leases.
//!
//! The per-shard scan lives on the capacity manager; this module holds its options, its
//! result type, and [`ScavengerService`], the background loop that drives it.

use std::ops::Add;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capacity::ShardCapacityManager;
use crate::error::CapacityError;

/// Predicate deciding whether an account is left alone during a scavenge pass.
pub type SkipAccount = Arc<dyn Fn(Uuid) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ScavengerOptions {
    /// Accounts inspected per pass, and concurrently
    pub accounts_peek_size: usize,
    /// Expired leases released per account, and concurrently
    pub leases_peek_size: usize,
    /// Releases in flight across all accounts
    pub concurrency: usize,
    pub skip_account: Option<SkipAccount>,
}

impl Default for ScavengerOptions {
    fn default() -> Self {
        Self {
            accounts_peek_size: 20,
            leases_peek_size: 20,
            concurrency: 20,
            skip_account: None,
        }
    }
}

impl std::fmt::Debug for ScavengerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScavengerOptions")
            .field("accounts_peek_size", &self.accounts_peek_size)
            .field("leases_peek_size", &self.leases_peek_size)
            .field("concurrency", &self.concurrency)
            .field("skip_account", &self.skip_account.is_some())
            .finish()
    }
}

impl ScavengerOptions {
    /// Adds `skip` to the accounts already skipped.
    pub fn also_skip(mut self, skip: SkipAccount) -> Self {
        self.skip_account = Some(match self.skip_account.take() {
            Some(existing) => Arc::new(move |account| existing(account) || skip(account)),
            None => skip,
        });
        self
    }

    pub(crate) fn skips(&self, account_id: Uuid) -> bool {
        self.skip_account
            .as_ref()
            .is_some_and(|skip| skip(account_id))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScavengeResult {
    /// Accounts holding at least one lease
    pub total_accounts_count: i64,
    /// Accounts whose earliest lease has expired
    pub total_expired_accounts_count: i64,
    /// Expired leases seen in the scanned accounts
    pub total_expired_leases_count: i64,
    pub scanned_accounts: i64,
    pub reclaimed_leases: i64,
}

impl Add for ScavengeResult {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            total_accounts_count: self.total_accounts_count + other.total_accounts_count,
            total_expired_accounts_count: self.total_expired_accounts_count
                + other.total_expired_accounts_count,
            total_expired_leases_count: self.total_expired_leases_count
                + other.total_expired_leases_count,
            scanned_accounts: self.scanned_accounts + other.scanned_accounts,
            reclaimed_leases: self.reclaimed_leases + other.reclaimed_leases,
        }
    }
}

impl std::iter::Sum for ScavengeResult {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Anything that can run one scavenge pass.
#[async_trait]
pub trait Scavenge: Send + Sync {
    async fn scavenge(&self, options: &ScavengerOptions) -> Result<ScavengeResult, CapacityError>;
}

#[async_trait]
impl Scavenge for ShardCapacityManager {
    async fn scavenge(&self, options: &ScavengerOptions) -> Result<ScavengeResult, CapacityError> {
        ShardCapacityManager::scavenge(self, options).await
    }
}

/// Runs scavenge passes on a fixed interval until shut down.
pub struct ScavengerService {
    target: Arc<dyn Scavenge>,
    options: ScavengerOptions,
    interval: Duration,
}

impl ScavengerService {
    pub fn new(target: Arc<dyn Scavenge>, options: ScavengerOptions, interval: Duration) -> Self {
        Self {
            target,
            options,
            interval,
        }
    }

    /// Runs one pass immediately.
    pub async fn run_once(&self) -> Result<ScavengeResult, CapacityError> {
        self.target.scavenge(&self.options).await
    }

    /// Main loop. Spawn it as a background task; it returns once `shutdown_rx` reads true.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            "lease-scavenger started"
        );
        loop {
            if *shutdown_rx.borrow() {
                info!("lease-scavenger shutting down");
                break;
            }

            match self.run_once().await {
                Ok(result) if result.reclaimed_leases > 0 => {
                    info!(
                        reclaimed = result.reclaimed_leases,
                        scanned_accounts = result.scanned_accounts,
                        expired_accounts = result.total_expired_accounts_count,
                        "lease-scavenger reclaimed expired leases"
                    );
                }
                Ok(result) => {
                    debug!(
                        accounts = result.total_accounts_count,
                        "lease-scavenger found nothing to reclaim"
                    );
                }
                Err(e) => warn!(error = %e, "lease-scavenger pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }
}
