
use std::time::Duration;

use leasekeeper::constraint::{
    ConcurrencyConfig, ConcurrencyConstraint, ConcurrencyMode, ConstraintConfig, ConstraintItem,
    CustomConcurrencyLimit, Scope,
};
use leasekeeper::error::{CapacityError, UserError};
use leasekeeper::request::{AcquireRequest, ScriptStatus};
use leasekeeper::store::KvClientExt;
use uuid::Uuid;

use test_helpers::*;

#[leasekeeper::test]
async fn grant_writes_lease_state_and_scavenger_entry() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let req = concurrency_request(account, function, "op-1", &["item-1"], 2, shard.now_ms());

    let resp = shard.manager.acquire(&req).await.expect("acquire");
    assert_eq!(resp.debug().status, ScriptStatus::Granted);
    assert_eq!(resp.leases.len(), 1);
    assert!(resp.limiting_constraints.is_empty());
    assert!(resp.request_id.is_some());

    let lease = &resp.leases[0];
    assert_eq!(lease.idempotency_key, "item-1");
    let expiry = shard.now_ms() + 5_000;
    assert_eq!(lease.expires_at_ms(), expiry);

    let keys = shard.manager.keys();
    let lease_id = lease.lease_id.to_string();
    assert_eq!(
        shard
            .store
            .zscore(&keys.account_leases(account), &lease_id)
            .await
            .unwrap(),
        Some(expiry)
    );
    assert_eq!(
        shard
            .store
            .zscore(&keys.in_progress_function(account, function), &lease_id)
            .await
            .unwrap(),
        Some(expiry)
    );
    assert_eq!(
        shard
            .store
            .zscore(&keys.scavenger_shard(), &account.to_string())
            .await
            .unwrap(),
        Some(expiry),
        "scavenger entry tracks the earliest lease expiry"
    );

    let details = shard
        .store
        .hgetall(&keys.lease_details(account, &lease_id))
        .await
        .unwrap();
    assert_eq!(details.get("lik").map(String::as_str), Some("item-1"));
    assert_eq!(details.get("oik").map(String::as_str), Some("op-1"));
    assert_eq!(
        details.get("fid").map(String::as_str),
        Some(function.to_string().as_str())
    );

    let request_id = resp.request_id.unwrap().to_string();
    let state_key = keys.request_state(account, &request_id);
    let raw = shard
        .store
        .get(&state_key)
        .await
        .unwrap()
        .expect("request state");
    let state: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(state["cv"], 1);
    assert_eq!(shard.store.pttl(&state_key).await.unwrap(), 60_000);
}

#[leasekeeper::test]
async fn stale_request_is_rejected() {
    let shard = open_shard();
    let req = concurrency_request(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "op-1",
        &["item-1"],
        1,
        shard.now_ms() - 6_000,
    );

    let err = shard.manager.acquire(&req).await.unwrap_err();
    assert_eq!(
        err.user_error(),
        Some(&UserError::StaleRequest {
            current_time_ms: START_MS - 6_000,
            delay_ms: 6_000,
        })
    );
    assert!(!err.is_retryable());
    assert_eq!(
        shard.store.eval_count(),
        0,
        "no script runs for a stale request"
    );
}

#[leasekeeper::test]
async fn request_within_allowed_delay_is_accepted() {
    let shard = open_shard();
    let req = concurrency_request(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "op-1",
        &["item-1"],
        1,
        shard.now_ms() - 5_000,
    );
    let resp = shard.manager.acquire(&req).await.expect("acquire");
    assert_eq!(resp.leases.len(), 1);
}

#[leasekeeper::test]
async fn malformed_request_is_a_user_error() {
    let shard = open_shard();
    let req = acquire_builder(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "op-1",
        &["a"],
        shard.now_ms(),
    )
    .amount(2)
    .build_unchecked();

    let err = shard.manager.acquire(&req).await.unwrap_err();
    assert!(matches!(
        err,
        CapacityError::User(UserError::MalformedRequest(_))
    ));
}

#[leasekeeper::test]
async fn unconfigured_rate_limit_is_unknown_constraint() {
    let shard = open_shard();
    let req = acquire_builder(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "op-1",
        &["a"],
        shard.now_ms(),
    )
    .constraint(ConstraintItem::RateLimit(Default::default()))
    .build()
    .unwrap();

    let err = shard.manager.acquire(&req).await.unwrap_err();
    assert!(matches!(
        err,
        CapacityError::User(UserError::UnknownConstraint(_))
    ));
}

#[leasekeeper::test]
async fn repeated_operation_key_replays_the_same_response() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let req = concurrency_request(account, function, "op-1", &["a", "b"], 5, shard.now_ms());

    let first = shard.manager.acquire(&req).await.unwrap();
    shard.advance(Duration::from_millis(500));
    let second = shard.manager.acquire(&req).await.unwrap();

    assert_eq!(first.without_debug(), second.without_debug());
    assert_eq!(first.debug().status, ScriptStatus::Granted);
    assert_eq!(second.debug().status, ScriptStatus::IdempotentReplay);
    assert_eq!(
        shard
            .store
            .zcard(&shard.manager.keys().account_leases(account))
            .await
            .unwrap(),
        2
    );
}

#[leasekeeper::test]
async fn replay_expires_with_operation_ttl() {
    let shard = open_shard_with(|c| c.operation_idempotency_ttl = Duration::from_secs(1));
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let req = concurrency_request(account, function, "op-1", &["a"], 1, shard.now_ms());
    let first = shard.manager.acquire(&req).await.unwrap();

    shard.advance(Duration::from_millis(1_500));
    let mut again = req.clone();
    again.current_time_ms = shard.now_ms();
    let second = shard.manager.acquire(&again).await.unwrap();

    // The lease is still live, so it is returned by its lease key rather than replayed.
    assert_eq!(second.debug().status, ScriptStatus::Granted);
    assert_ne!(first.request_id, second.request_id);
    assert_eq!(second.leases, first.leases);
}

#[leasekeeper::test]
async fn existing_lease_key_is_returned_without_a_new_grant() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let first = shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-1",
            &["item-1"],
            1,
            shard.now_ms(),
        ))
        .await
        .unwrap();

    // Function is at its limit, but the lease for item-1 is already held.
    let second = shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-2",
            &["item-1"],
            1,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    assert_eq!(second.debug().status, ScriptStatus::Granted);
    assert_eq!(second.leases, first.leases);
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
async fn concurrency_limit_caps_grants_and_reports_limiting() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());

    let resp = shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-1",
            &["a", "b", "c"],
            2,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.debug().status, ScriptStatus::Granted);
    assert_eq!(resp.leases.len(), 2);
    assert_eq!(
        resp.limiting_constraints,
        vec![ConstraintItem::function_concurrency()]
    );
    assert_eq!(
        resp.exhausted_constraints,
        vec![ConstraintItem::function_concurrency()]
    );

    let denied = shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-2",
            &["d"],
            2,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    assert_eq!(denied.debug().status, ScriptStatus::LackingCapacity);
    assert!(denied.leases.is_empty());
    assert_eq!(denied.fairness_reduction, 0);
    // Earliest active lease expires before the default concurrency retry window ends.
    assert_eq!(denied.retry_after_ms, shard.now_ms() + 2_000);

    shard.advance(Duration::from_millis(5_001));
    let later = shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-3",
            &["d"],
            2,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    assert_eq!(later.leases.len(), 1, "expired leases stop counting");
}

#[leasekeeper::test]
async fn limit_of_zero_is_unlimited() {
    let shard = open_shard();
    let keys: Vec<String> = (0..50).map(|i| format!("item-{i}")).collect();
    let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
    let resp = shard
        .manager
        .acquire(&concurrency_request(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "op-1",
            &refs,
            0,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    assert_eq!(resp.leases.len(), 50);
    assert!(resp.exhausted_constraints.is_empty());
}

#[leasekeeper::test]
async fn account_and_function_limits_combine() {
    let shard = open_shard();
    let account = Uuid::new_v4();
    let config = ConstraintConfig {
        concurrency: ConcurrencyConfig {
            account_concurrency: 3,
            function_concurrency: 10,
            ..Default::default()
        },
        ..Default::default()
    };
    let request = |function: Uuid, op: &str, leases: &[&str]| {
        let mut builder = AcquireRequest::builder(account, op)
            .function_id(function)
            .current_time_ms(shard.now_ms())
            .configuration(config.clone())
            .constraint(ConstraintItem::function_concurrency())
            .constraint(ConstraintItem::account_concurrency());
        for l in leases {
            builder = builder.lease(*l);
        }
        builder.build().unwrap()
    };

    let first = shard
        .manager
        .acquire(&request(Uuid::new_v4(), "op-1", &["a", "b"]))
        .await
        .unwrap();
    assert_eq!(first.leases.len(), 2);

    let second = shard
        .manager
        .acquire(&request(Uuid::new_v4(), "op-2", &["c", "d"]))
        .await
        .unwrap();
    assert_eq!(second.leases.len(), 1);
    assert_eq!(
        second.limiting_constraints,
        vec![ConstraintItem::account_concurrency()]
    );
}

#[leasekeeper::test]
async fn run_mode_leases_count_in_run_sets() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let run_item = ConstraintItem::Concurrency(ConcurrencyConstraint {
        mode: ConcurrencyMode::Run,
        scope: Scope::Fn,
        ..Default::default()
    });
    let config = ConstraintConfig {
        concurrency: ConcurrencyConfig {
            function_run_concurrency: 1,
            ..Default::default()
        },
        ..Default::default()
    };
    let req = AcquireRequest::builder(account, "op-1")
        .function_id(function)
        .current_time_ms(shard.now_ms())
        .configuration(config)
        .constraint(run_item)
        .lease_for_run("step-1", Uuid::new_v4())
        .lease_for_run("step-2", Uuid::new_v4())
        .build()
        .unwrap();

    let resp = shard.manager.acquire(&req).await.unwrap();
    assert_eq!(resp.leases.len(), 1);
    let run_set = shard
        .manager
        .keys()
        .in_progress_function_runs(account, function);
    assert_eq!(shard.store.zcard(&run_set).await.unwrap(), 1);
    let step_set = shard.manager.keys().in_progress_function(account, function);
    assert_eq!(shard.store.zcard(&step_set).await.unwrap(), 0);
}

#[leasekeeper::test]
async fn custom_concurrency_keys_are_isolated_per_evaluated_key() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let config = ConstraintConfig {
        concurrency: ConcurrencyConfig {
            custom_concurrency_keys: vec![CustomConcurrencyLimit {
                mode: ConcurrencyMode::Step,
                scope: Scope::Fn,
                key_expression_hash: "expr".into(),
                limit: 1,
            }],
            ..Default::default()
        },
        ..Default::default()
    };
    let custom = |evaluated: &str| {
        ConstraintItem::Concurrency(ConcurrencyConstraint {
            mode: ConcurrencyMode::Step,
            scope: Scope::Fn,
            key_expression_hash: "expr".into(),
            evaluated_key_hash: evaluated.into(),
        })
    };
    let request = |op: &str, lease: &str, evaluated: &str| {
        AcquireRequest::builder(account, op)
            .function_id(function)
            .current_time_ms(shard.now_ms())
            .configuration(config.clone())
            .constraint(custom(evaluated))
            .lease(lease)
            .build()
            .unwrap()
    };

    assert_eq!(
        shard
            .manager
            .acquire(&request("op-1", "a", "user-1"))
            .await
            .unwrap()
            .leases
            .len(),
        1
    );
    assert_eq!(
        shard
            .manager
            .acquire(&request("op-2", "b", "user-1"))
            .await
            .unwrap()
            .leases
            .len(),
        0
    );
    assert_eq!(
        shard
            .manager
            .acquire(&request("op-3", "c", "user-2"))
            .await
            .unwrap()
            .leases
            .len(),
        1
    );
}

#[leasekeeper::test]
async fn granted_leases_record_constraint_check_idempotency() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-1",
            &["item-1"],
            1,
            shard.now_ms(),
        ))
        .await
        .unwrap();

    assert!(shard
        .manager
        .constraint_check_idempotent(account, "item-1")
        .await
        .unwrap());
    assert!(!shard
        .manager
        .constraint_check_idempotent(account, "item-2")
        .await
        .unwrap());

    shard.advance(Duration::from_millis(10_001));
    assert!(!shard
        .manager
        .constraint_check_idempotent(account, "item-1")
        .await
        .unwrap());
}

#[leasekeeper::test]
async fn store_outage_is_retryable() {
    let shard = open_shard();
    shard.store.set_available(false);
    let req = concurrency_request(
        Uuid::new_v4(),
        Uuid::new_v4(),
        "op-1",
        &["a"],
        1,
        shard.now_ms(),
    );
    let err = shard.manager.acquire(&req).await.unwrap_err();
    assert!(err.is_retryable(), "outage should be retryable: {err}");

    shard.store.set_available(true);
    let resp = shard.manager.acquire(&req).await.unwrap();
    assert_eq!(resp.leases.len(), 1);
}

#[leasekeeper::test]
fn empty_shard_name_is_rejected() {
    let clock = new_clock();
    let store = std::sync::Arc::new(leasekeeper::store::MemoryStore::new("s", clock.clone()));
    let config = shard_config("", store, clock);
    assert!(leasekeeper::capacity::ShardCapacityManager::new(config).is_err());
}
