use std::sync::Arc;

use futures::{stream, StreamExt, TryStreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, instrument};
use ulid::Ulid;
use uuid::Uuid;

use crate::error::{CapacityError, InternalError};
use crate::request::{LeaseSource, ReleaseRequest, ScriptStatus};
use crate::scavenger::{ScavengeResult, ScavengerOptions};
use crate::store::KvClientExt;

use super::ShardCapacityManager;

#[derive(Debug, Default, Clone, Copy)]
struct AccountOutcome {
    expired: i64,
    reclaimed: i64,
}

impl ShardCapacityManager {
    /// One scavenge pass: finds accounts whose earliest lease has expired and releases
    /// their expired leases through [`ShardCapacityManager::release`], so lifecycle hooks
    /// fire exactly as for caller-initiated releases.
    #[instrument(skip_all, fields(shard = %self.name))]
    pub async fn scavenge(
        &self,
        options: &ScavengerOptions,
    ) -> Result<ScavengeResult, CapacityError> {
        let now_ms = self.clock.now_ms();
        let shard_key = self.keys.scavenger_shard();
        let total_accounts = self.with_timeout(self.client.zcard(&shard_key)).await?;
        let expired_accounts = self
            .with_timeout(self.client.zcount(&shard_key, i64::MIN, now_ms))
            .await?;
        let accounts = self.peek_accounts(&shard_key, now_ms, options).await?;

        let permits = Arc::new(Semaphore::new(options.concurrency.max(1)));
        let outcomes: Vec<AccountOutcome> = stream::iter(accounts.iter().copied())
            .map(|account| self.scavenge_account(account, now_ms, options, permits.clone()))
            .buffer_unordered(options.accounts_peek_size.max(1))
            .try_collect()
            .await?;

        let result = ScavengeResult {
            total_accounts_count: total_accounts,
            total_expired_accounts_count: expired_accounts,
            total_expired_leases_count: outcomes.iter().map(|o| o.expired).sum(),
            scanned_accounts: accounts.len() as i64,
            reclaimed_leases: outcomes.iter().map(|o| o.reclaimed).sum(),
        };
        if let Some(m) = &self.metrics {
            m.record_scavenge(
                &self.name,
                result.reclaimed_leases as u64,
                result.total_expired_accounts_count,
            );
        }
        Ok(result)
    }

    /// Up to `accounts_peek_size` expired accounts in expiry order, paging past skipped
    /// accounts so they cannot hold the window.
    async fn peek_accounts(
        &self,
        shard_key: &str,
        now_ms: i64,
        options: &ScavengerOptions,
    ) -> Result<Vec<Uuid>, CapacityError> {
        let want = options.accounts_peek_size.max(1);
        let mut accounts = Vec::with_capacity(want);
        let mut offset = 0;
        while accounts.len() < want {
            let page = self
                .with_timeout(self.client.zrange_by_score_page(
                    shard_key,
                    i64::MIN,
                    now_ms,
                    offset,
                    Some(want),
                ))
                .await?;
            offset += page.len();
            let exhausted = page.len() < want;
            for (member, _) in page {
                let Ok(account) = Uuid::parse_str(&member) else {
                    continue;
                };
                if options.skips(account) {
                    debug!(account_id = %account, "skipping account");
                    continue;
                }
                if accounts.len() < want {
                    accounts.push(account);
                }
            }
            if exhausted {
                break;
            }
        }
        Ok(accounts)
    }

    async fn scavenge_account(
        &self,
        account_id: Uuid,
        now_ms: i64,
        options: &ScavengerOptions,
        permits: Arc<Semaphore>,
    ) -> Result<AccountOutcome, CapacityError> {
        let lease_index = self.keys.account_leases(account_id);
        let expired_total = self
            .with_timeout(self.client.zcount(&lease_index, i64::MIN, now_ms))
            .await?;
        let expired = self
            .with_timeout(self.client.zrange_by_score(
                &lease_index,
                i64::MIN,
                now_ms,
                Some(options.leases_peek_size.max(1)),
            ))
            .await?;
        let lease_ids: Vec<Ulid> = expired
            .iter()
            .filter_map(|(member, _)| member.parse().ok())
            .collect();

        let released: Vec<bool> = stream::iter(lease_ids)
            .map(|lease_id| {
                let permits = permits.clone();
                async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| InternalError::fatal("scavenger semaphore closed"))?;
                    let req = ReleaseRequest::new(account_id, lease_id, lease_id.to_string())
                        .with_source(LeaseSource::scavenger());
                    let resp = self.release(&req).await?;
                    Ok::<_, CapacityError>(resp.debug().status == ScriptStatus::Granted)
                }
            })
            .buffer_unordered(options.leases_peek_size.max(1))
            .try_collect()
            .await?;

        let outcome = AccountOutcome {
            expired: expired_total,
            reclaimed: released.iter().filter(|r| **r).count() as i64,
        };
        debug!(
            account_id = %account_id,
            expired = outcome.expired,
            reclaimed = outcome.reclaimed,
            "scavenged account"
        );
        Ok(outcome)
    }
}
