
use std::collections::HashMap;
use std::time::Duration;

use leasekeeper::cache::{LimitingCacheOptions, LimitingConstraintCache};
use leasekeeper::capacity::CapacityManager;
use leasekeeper::constraint::{ConstraintItem, ConstraintKind};
use leasekeeper::request::{ReleaseRequest, ScriptStatus};
use uuid::Uuid;

use test_helpers::*;

#[leasekeeper::test]
async fn limiting_cache_short_circuits_known_denials() {
    let TestShard {
        clock,
        store,
        manager,
    } = open_shard();
    let cache =
        LimitingConstraintCache::new(manager, clock.clone(), LimitingCacheOptions::default());
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let now = || {
        use leasekeeper::clock::Clock;
        clock.now_ms()
    };

    let granted = cache
        .acquire(&concurrency_request(
            account,
            function,
            "op-1",
            &["a"],
            1,
            now(),
        ))
        .await
        .unwrap();
    assert_eq!(granted.leases.len(), 1);
    assert!(cache.is_empty(), "grants are not cached");

    let denied = cache
        .acquire(&concurrency_request(
            account,
            function,
            "op-2",
            &["b"],
            1,
            now(),
        ))
        .await
        .unwrap();
    assert!(denied.leases.is_empty());
    assert_eq!(cache.len(), 1);
    let evals = store.eval_count();

    let cached = cache
        .acquire(&concurrency_request(
            account,
            function,
            "op-3",
            &["c"],
            1,
            now(),
        ))
        .await
        .unwrap();
    assert_eq!(store.eval_count(), evals, "served without a script");
    assert!(cached.leases.is_empty());
    assert_eq!(cached.debug().status, ScriptStatus::LackingCapacity);
    assert_eq!(
        cached.limiting_constraints,
        vec![ConstraintItem::function_concurrency()]
    );
    assert_eq!(cached.retry_after_ms, denied.retry_after_ms);

    // Other functions are unaffected.
    let other = cache
        .acquire(&concurrency_request(
            account,
            Uuid::new_v4(),
            "op-4",
            &["d"],
            1,
            now(),
        ))
        .await
        .unwrap();
    assert_eq!(other.leases.len(), 1);

    // Releases pass through, and the entry lapses at the retry time.
    cache
        .release(&ReleaseRequest::new(
            account,
            granted.leases[0].lease_id,
            "rel-1",
        ))
        .await
        .unwrap();
    clock.advance(Duration::from_millis(2_001));
    let after = cache
        .acquire(&concurrency_request(
            account,
            function,
            "op-5",
            &["e"],
            1,
            now(),
        ))
        .await
        .unwrap();
    assert_eq!(after.leases.len(), 1);
    assert!(store.eval_count() > evals);
}

#[leasekeeper::test]
async fn limiting_cache_prunes_least_recently_used() {
    let TestShard { clock, manager, .. } = open_shard();
    let options = LimitingCacheOptions {
        max_entries: 2,
        prune_count: 1,
        ttl_overrides: HashMap::from([(ConstraintKind::Concurrency, Duration::from_secs(30))]),
    };
    let cache = LimitingConstraintCache::new(manager, clock.clone(), options);
    let account = Uuid::new_v4();
    let start = {
        use leasekeeper::clock::Clock;
        clock.now_ms()
    };

    for (i, function) in [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()]
        .into_iter()
        .enumerate()
    {
        cache
            .acquire(&concurrency_request(
                account,
                function,
                &format!("fill-{i}"),
                &["x"],
                1,
                start,
            ))
            .await
            .unwrap();
        let resp = cache
            .acquire(&concurrency_request(
                account,
                function,
                &format!("deny-{i}"),
                &["y"],
                1,
                start,
            ))
            .await
            .unwrap();
        assert!(resp.leases.is_empty());
    }
    assert_eq!(cache.len(), 2);
}

#[leasekeeper::test]
async fn acquire_response_cache_serves_repeated_denials() {
    let shard = open_shard_with(|c| c.acquire_response_cache_ttl = Duration::from_millis(1));
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-1",
            &["a"],
            1,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    let denied = shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-2",
            &["b"],
            1,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    assert!(denied.leases.is_empty());
    let evals = shard.store.eval_count();

    let cached = shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-3",
            &["c"],
            1,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    assert_eq!(shard.store.eval_count(), evals);
    assert_eq!(cached.without_debug(), denied.without_debug());
    assert_eq!(cached.debug().status, ScriptStatus::LackingCapacity);

    shard.advance(Duration::from_millis(1));
    shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-4",
            &["d"],
            1,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    assert_eq!(
        shard.store.eval_count(),
        evals + 1,
        "entry lapsed after its ttl"
    );
}
