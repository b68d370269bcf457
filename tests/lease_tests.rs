
use std::sync::Arc;
use std::time::Duration;

use leasekeeper::lifecycle::{CapacityLifecycle, Lifecycles, RecordingLifecycle};
use leasekeeper::request::{
    CallerLocation, ExtendLeaseRequest, Lease, LeaseService, LeaseSource, ReleaseRequest,
    ScriptStatus,
};
use leasekeeper::store::KvClientExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ulid::Ulid;
use uuid::Uuid;

use test_helpers::*;

async fn acquire_one(shard: &TestShard, account: Uuid, function: Uuid, key: &str) -> Lease {
    let req = concurrency_request(
        account,
        function,
        &format!("op-{key}"),
        &[key],
        10,
        shard.now_ms(),
    );
    let resp = shard.manager.acquire(&req).await.expect("acquire");
    resp.leases.into_iter().next().expect("lease granted")
}

#[leasekeeper::test]
async fn extend_moves_lease_to_a_new_id() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let lease = acquire_one(&shard, account, function, "item-1").await;

    shard.advance(Duration::from_secs(1));
    let resp = shard
        .manager
        .extend_lease(&ExtendLeaseRequest::new(
            account,
            lease.lease_id,
            Duration::from_secs(5),
            "ext-1",
        ))
        .await
        .unwrap();
    assert_eq!(resp.debug().status, ScriptStatus::Granted);
    let new_id = resp.lease_id.expect("new lease id");
    assert_ne!(new_id, lease.lease_id);
    let new_expiry = shard.now_ms() + 5_000;
    assert_eq!(new_id.timestamp_ms() as i64, new_expiry);

    let keys = shard.manager.keys();
    let (old, new) = (lease.lease_id.to_string(), new_id.to_string());
    let index = keys.account_leases(account);
    let in_progress = keys.in_progress_function(account, function);
    assert_eq!(shard.store.zscore(&index, &old).await.unwrap(), None);
    assert_eq!(
        shard.store.zscore(&index, &new).await.unwrap(),
        Some(new_expiry)
    );
    assert_eq!(shard.store.zscore(&in_progress, &old).await.unwrap(), None);
    assert_eq!(
        shard.store.zscore(&in_progress, &new).await.unwrap(),
        Some(new_expiry)
    );
    assert!(!shard
        .store
        .exists(&keys.lease_details(account, &old))
        .await
        .unwrap());
    let details = shard
        .store
        .hgetall(&keys.lease_details(account, &new))
        .await
        .unwrap();
    assert_eq!(details.get("lik").map(String::as_str), Some("item-1"));
    assert_eq!(
        shard
            .store
            .zscore(&keys.scavenger_shard(), &account.to_string())
            .await
            .unwrap(),
        Some(new_expiry)
    );
}

#[leasekeeper::test]
async fn extend_replays_by_idempotency_key() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let lease = acquire_one(&shard, account, function, "item-1").await;
    let req = ExtendLeaseRequest::new(account, lease.lease_id, Duration::from_secs(5), "ext-1");

    let first = shard.manager.extend_lease(&req).await.unwrap();
    shard.advance(Duration::from_millis(100));
    let second = shard.manager.extend_lease(&req).await.unwrap();
    assert_eq!(first.without_debug(), second.without_debug());
    assert_eq!(second.debug().status, ScriptStatus::IdempotentReplay);
    assert_eq!(
        shard
            .store
            .zcard(&shard.manager.keys().account_leases(account))
            .await
            .unwrap(),
        1
    );
}

#[leasekeeper::test]
async fn extend_of_unknown_lease_returns_nothing() {
    let shard = open_shard();
    let account = Uuid::new_v4();
    let req = ExtendLeaseRequest::new(account, Ulid::new(), Duration::from_secs(5), "ext-1");

    let resp = shard.manager.extend_lease(&req).await.unwrap();
    assert_eq!(resp.lease_id, None);
    assert_eq!(resp.debug().status, ScriptStatus::LackingCapacity);
    let op_key = shard
        .manager
        .keys()
        .operation_idempotency(account, "ext", "ext-1");
    assert!(
        !shard.store.exists(&op_key).await.unwrap(),
        "a miss leaves no idempotency record"
    );
}

#[leasekeeper::test]
async fn extend_of_expired_lease_returns_nothing() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let lease = acquire_one(&shard, account, function, "item-1").await;

    shard.advance(Duration::from_millis(5_000));
    let resp = shard
        .manager
        .extend_lease(&ExtendLeaseRequest::new(
            account,
            lease.lease_id,
            Duration::from_secs(5),
            "ext-1",
        ))
        .await
        .unwrap();
    assert_eq!(resp.lease_id, None);
}

#[leasekeeper::test]
async fn extend_cannot_pass_maximum_lifetime() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let req = acquire_builder(account, function, "op-1", &["item-1"], shard.now_ms())
        .configuration(function_limit(1))
        .maximum_lifetime(Duration::from_secs(10))
        .build()
        .unwrap();
    let lease = shard.manager.acquire(&req).await.unwrap().leases[0].clone();

    shard.advance(Duration::from_secs(4));
    let within = shard
        .manager
        .extend_lease(&ExtendLeaseRequest::new(
            account,
            lease.lease_id,
            Duration::from_secs(5),
            "ext-1",
        ))
        .await
        .unwrap();
    let extended = within.lease_id.expect("extension within lifetime");

    shard.advance(Duration::from_secs(2));
    let beyond = shard
        .manager
        .extend_lease(&ExtendLeaseRequest::new(
            account,
            extended,
            Duration::from_secs(5),
            "ext-2",
        ))
        .await
        .unwrap();
    assert_eq!(beyond.lease_id, None);
    assert_eq!(
        shard
            .store
            .zscore(
                &shard.manager.keys().account_leases(account),
                &extended.to_string()
            )
            .await
            .unwrap(),
        Some(START_MS + 9_000),
        "a denied extension leaves the lease untouched"
    );
}

#[leasekeeper::test]
async fn release_removes_lease_and_reports_its_origin() {
    let shard = open_shard();
    let (account, env, function) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    let source = LeaseSource {
        service: LeaseService::Executor,
        location: CallerLocation::ItemLease,
        ..Default::default()
    };
    let req = acquire_builder(account, function, "op-1", &["item-1"], shard.now_ms())
        .env_id(env)
        .source(source)
        .configuration(function_limit(1))
        .build()
        .unwrap();
    let lease = shard.manager.acquire(&req).await.unwrap().leases[0].clone();

    let resp = shard
        .manager
        .release(&ReleaseRequest::new(account, lease.lease_id, "rel-1"))
        .await
        .unwrap();
    assert_eq!(resp.debug().status, ScriptStatus::Granted);
    assert_eq!(resp.account_id, account);
    assert_eq!(resp.env_id, env);
    assert_eq!(resp.function_id, function);
    assert_eq!(resp.creation_source, source);

    let keys = shard.manager.keys();
    assert_eq!(
        shard
            .store
            .zcard(&keys.account_leases(account))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        shard
            .store
            .zcard(&keys.in_progress_function(account, function))
            .await
            .unwrap(),
        0
    );
    assert!(!shard
        .store
        .exists(&keys.lease_details(account, &lease.lease_id.to_string()))
        .await
        .unwrap());
    assert_eq!(
        shard
            .store
            .zscore(&keys.scavenger_shard(), &account.to_string())
            .await
            .unwrap(),
        None,
        "an account without leases leaves the scavenger shard"
    );

    // Capacity is available again.
    let again = concurrency_request(account, function, "op-2", &["item-2"], 1, shard.now_ms());
    assert_eq!(shard.manager.acquire(&again).await.unwrap().leases.len(), 1);
}

#[leasekeeper::test]
async fn release_is_idempotent() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let lease = acquire_one(&shard, account, function, "item-1").await;
    let req = ReleaseRequest::new(account, lease.lease_id, "rel-1");

    let first = shard.manager.release(&req).await.unwrap();
    let second = shard.manager.release(&req).await.unwrap();
    assert_eq!(first.without_debug(), second.without_debug());
    assert_eq!(second.debug().status, ScriptStatus::IdempotentReplay);

    let other_key = shard
        .manager
        .release(&ReleaseRequest::new(account, lease.lease_id, "rel-2"))
        .await
        .unwrap();
    assert_eq!(other_key.debug().status, ScriptStatus::LackingCapacity);
    assert_eq!(other_key.function_id, Uuid::nil());
}

#[leasekeeper::test]
async fn expired_lease_can_still_be_released() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let lease = acquire_one(&shard, account, function, "item-1").await;

    shard.advance(Duration::from_secs(30));
    let resp = shard
        .manager
        .release(&ReleaseRequest::new(account, lease.lease_id, "rel-1"))
        .await
        .unwrap();
    assert_eq!(resp.debug().status, ScriptStatus::Granted);
    assert_eq!(resp.function_id, function);
}

#[leasekeeper::test]
async fn lifecycle_hooks_fire_once_per_effect() {
    let recorder = Arc::new(RecordingLifecycle::new());
    let hooks: Arc<dyn CapacityLifecycle> = recorder.clone();
    let shard = open_shard_with(move |c| c.lifecycles = Lifecycles::new(vec![hooks]));
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());

    let req = concurrency_request(account, function, "op-1", &["a", "b"], 10, shard.now_ms());
    let acquired = shard.manager.acquire(&req).await.unwrap();
    shard.manager.acquire(&req).await.unwrap();
    let events = recorder.acquired();
    assert_eq!(events.len(), 1, "replays do not notify");
    assert_eq!(events[0].leases, acquired.leases);
    assert_eq!(events[0].account_id, account);

    // Only the new lease is reported when one key is already held.
    let mixed = concurrency_request(account, function, "op-2", &["a", "c"], 10, shard.now_ms());
    let resp = shard.manager.acquire(&mixed).await.unwrap();
    assert_eq!(resp.leases.len(), 2);
    let events = recorder.acquired();
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].leases.len(), 1);
    assert_eq!(events[1].leases[0].idempotency_key, "c");

    let lease_id = acquired.leases[0].lease_id;
    let ext = ExtendLeaseRequest::new(account, lease_id, Duration::from_secs(5), "ext-1");
    let extended = shard.manager.extend_lease(&ext).await.unwrap();
    shard.manager.extend_lease(&ext).await.unwrap();
    let events = recorder.extended();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].previous_lease_id, lease_id);
    assert_eq!(Some(events[0].lease_id), extended.lease_id);

    let rel = ReleaseRequest::new(account, extended.lease_id.unwrap(), "rel-1")
        .with_source(LeaseSource::scavenger());
    shard.manager.release(&rel).await.unwrap();
    shard.manager.release(&rel).await.unwrap();
    let events = recorder.released();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].release_source, LeaseSource::scavenger());
    assert_eq!(events[0].function_id, function);

    // Misses do not notify.
    shard
        .manager
        .release(&ReleaseRequest::new(account, Ulid::new(), "rel-2"))
        .await
        .unwrap();
    assert_eq!(recorder.released().len(), 1);
}

/// Checks the account's bookkeeping after every step of a mixed workload.
async fn assert_account_consistent(shard: &TestShard, account: Uuid, function: Uuid, limit: u64) {
    let keys = shard.manager.keys();
    let now = shard.now_ms();
    let active = shard
        .store
        .zcount(
            &keys.in_progress_function(account, function),
            now + 1,
            i64::MAX,
        )
        .await
        .unwrap();
    assert!(
        active as u64 <= limit,
        "{active} active leases over limit {limit}"
    );

    let earliest = shard
        .store
        .zrange_with_scores(&keys.account_leases(account))
        .await
        .unwrap()
        .first()
        .map(|(_, score)| *score);
    let indexed = shard
        .store
        .zscore(&keys.scavenger_shard(), &account.to_string())
        .await
        .unwrap();
    assert_eq!(
        indexed, earliest,
        "scavenger entry out of step with the lease index"
    );
}

#[leasekeeper::test]
async fn random_lease_traffic_keeps_bookkeeping_consistent() {
    use leasekeeper::scavenger::ScavengerOptions;

    const LIMIT: i64 = 4;
    for seed in 0..4u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let shard = open_shard();
        let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
        let mut held: Vec<Ulid> = Vec::new();

        for step in 0..150 {
            match rng.gen_range(0..10) {
                0..=3 => {
                    let count = rng.gen_range(1..=3);
                    let lease_keys: Vec<String> =
                        (0..count).map(|n| format!("s{seed}-{step}-{n}")).collect();
                    let lease_keys: Vec<&str> = lease_keys.iter().map(String::as_str).collect();
                    let req = concurrency_request(
                        account,
                        function,
                        &format!("op-{step}"),
                        &lease_keys,
                        LIMIT,
                        shard.now_ms(),
                    );
                    let resp = shard.manager.acquire(&req).await.unwrap();
                    held.extend(resp.leases.iter().map(|l| l.lease_id));
                }
                4 | 5 if !held.is_empty() => {
                    let idx = rng.gen_range(0..held.len());
                    let duration = Duration::from_millis(rng.gen_range(1_000..8_000));
                    let resp = shard
                        .manager
                        .extend_lease(&ExtendLeaseRequest::new(
                            account,
                            held[idx],
                            duration,
                            format!("ext-{step}"),
                        ))
                        .await
                        .unwrap();
                    match resp.lease_id {
                        Some(new_id) => held[idx] = new_id,
                        None => {
                            held.swap_remove(idx);
                        }
                    }
                }
                6 if !held.is_empty() => {
                    let idx = rng.gen_range(0..held.len());
                    let lease_id = held.swap_remove(idx);
                    shard
                        .manager
                        .release(&ReleaseRequest::new(
                            account,
                            lease_id,
                            format!("rel-{step}"),
                        ))
                        .await
                        .unwrap();
                }
                7 => {
                    shard
                        .manager
                        .scavenge(&ScavengerOptions::default())
                        .await
                        .unwrap();
                }
                _ => shard.advance(Duration::from_millis(rng.gen_range(0..3_000))),
            }
            assert_account_consistent(&shard, account, function, LIMIT as u64).await;
        }
    }
}
