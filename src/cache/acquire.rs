use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::clock::{duration_ms, Clock};
use crate::constraint::{ConstraintItem, Scope};
use crate::request::{AcquireResponse, ScriptStatus};

const CAPACITY: usize = 10_000;

/// Cache key for the built-in account and function concurrency limits. Custom keys and
/// other kinds are never cached.
fn cache_key(item: &ConstraintItem, account_id: Uuid, function_id: Uuid) -> Option<String> {
    let ConstraintItem::Concurrency(c) = item else {
        return None;
    };
    if c.is_custom_key() {
        return None;
    }
    match c.scope {
        Scope::Account => Some(format!("acq:a:{account_id}")),
        Scope::Fn => Some(format!("acq:f:{function_id}")),
        Scope::Env => None,
    }
}

/// Short-lived copies of denied Acquire responses.
#[derive(Debug)]
pub struct AcquireResponseCache {
    ttl_ms: i64,
    clock: Arc<dyn Clock>,
    entries: Mutex<LruCache<String, (AcquireResponse, i64)>>,
}

impl AcquireResponseCache {
    /// `None` when `ttl` is zero, which disables the cache.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Option<Self> {
        if ttl.is_zero() {
            return None;
        }
        Some(Self {
            ttl_ms: duration_ms(ttl).max(1),
            clock,
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    pub fn get(
        &self,
        account_id: Uuid,
        function_id: Uuid,
        constraints: &[ConstraintItem],
    ) -> Option<AcquireResponse> {
        let now_ms = self.clock.now_ms();
        let mut entries = self.entries.lock();
        for key in constraints
            .iter()
            .filter_map(|item| cache_key(item, account_id, function_id))
        {
            match entries.get(&key) {
                Some((resp, expires_at)) if *expires_at > now_ms => return Some(resp.clone()),
                Some(_) => {
                    entries.pop(&key);
                }
                None => {}
            }
        }
        None
    }

    /// Stores `resp` when it is an outright denial by a cacheable constraint.
    pub fn put(&self, account_id: Uuid, function_id: Uuid, resp: &AcquireResponse) {
        if resp.debug().status != ScriptStatus::LackingCapacity || !resp.leases.is_empty() {
            return;
        }
        let expires_at = self.clock.now_ms() + self.ttl_ms;
        let mut entries = self.entries.lock();
        for key in resp
            .limiting_constraints
            .iter()
            .filter_map(|item| cache_key(item, account_id, function_id))
        {
            entries.put(key, (resp.clone(), expires_at));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::constraint::ConcurrencyConstraint;

    fn denied(limiting: ConstraintItem) -> AcquireResponse {
        let mut resp = AcquireResponse::retry_at(5_000);
        resp.limiting_constraints = vec![limiting];
        resp
    }

    #[test]
    fn zero_ttl_disables() {
        let clock = Arc::new(ManualClock::new(0));
        assert!(AcquireResponseCache::new(Duration::ZERO, clock).is_none());
    }

    #[test]
    fn caches_function_denials_until_ttl() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = AcquireResponseCache::new(Duration::from_millis(10), clock.clone()).unwrap();
        let account = Uuid::new_v4();
        let function = Uuid::new_v4();
        let item = ConstraintItem::function_concurrency();
        cache.put(account, function, &denied(item.clone()));

        let hit = cache
            .get(account, function, std::slice::from_ref(&item))
            .unwrap();
        assert_eq!(hit.retry_after_ms, 5_000);
        assert!(cache
            .get(account, Uuid::new_v4(), std::slice::from_ref(&item))
            .is_none());

        clock.advance(Duration::from_millis(10));
        assert!(cache.get(account, function, &[item]).is_none());
    }

    #[test]
    fn custom_keys_and_grants_are_not_cached() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = AcquireResponseCache::new(Duration::from_secs(1), clock).unwrap();
        let account = Uuid::new_v4();
        let custom = ConstraintItem::Concurrency(ConcurrencyConstraint {
            scope: Scope::Account,
            key_expression_hash: "kh".to_string(),
            evaluated_key_hash: "eh".to_string(),
            ..Default::default()
        });
        cache.put(account, Uuid::nil(), &denied(custom.clone()));
        assert!(cache.get(account, Uuid::nil(), &[custom]).is_none());

        let mut granted = denied(ConstraintItem::account_concurrency());
        granted.debug.status = ScriptStatus::Granted;
        cache.put(account, Uuid::nil(), &granted);
        assert!(cache
            .get(
                account,
                Uuid::nil(),
                &[ConstraintItem::account_concurrency()]
            )
            .is_none());
    }
}
