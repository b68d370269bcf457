
use std::time::Duration;

use leasekeeper::constraint::{
    ConcurrencyConfig, ConstraintConfig, ConstraintItem, RateLimitConfig, RateLimitConstraint,
    Scope, ThrottleConfig, ThrottleConstraint,
};
use leasekeeper::request::{CheckRequest, ScriptStatus};
use uuid::Uuid;

use test_helpers::*;

fn rate_limited(limit: i64, period_secs: i64) -> ConstraintConfig {
    ConstraintConfig {
        rate_limit: vec![RateLimitConfig {
            scope: Scope::Fn,
            limit,
            period_secs,
            key_expression_hash: String::new(),
        }],
        ..Default::default()
    }
}

fn throttled(limit: i64, burst: i64, period_secs: i64) -> ConstraintConfig {
    ConstraintConfig {
        throttle: vec![ThrottleConfig {
            scope: Scope::Fn,
            limit,
            burst,
            period_secs,
            key_expression_hash: String::new(),
        }],
        ..Default::default()
    }
}

fn rate_limit_item() -> ConstraintItem {
    ConstraintItem::RateLimit(RateLimitConstraint {
        scope: Scope::Fn,
        ..Default::default()
    })
}

fn throttle_item() -> ConstraintItem {
    ConstraintItem::Throttle(ThrottleConstraint {
        scope: Scope::Fn,
        ..Default::default()
    })
}

#[leasekeeper::test]
async fn rate_limit_admits_at_most_n_plus_one_per_window() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());

    let mut granted = 0;
    for step in 0..=100 {
        let lease_key = format!("item-{step}");
        let req = acquire_builder(
            account,
            function,
            &format!("op-{step}"),
            &[lease_key.as_str()],
            shard.now_ms(),
        )
        .configuration(rate_limited(10, 1))
        .constraint(rate_limit_item())
        .build()
        .unwrap();
        let resp = shard.manager.acquire(&req).await.unwrap();
        if step == 1 {
            assert!(resp.leases.is_empty());
            assert_eq!(resp.limiting_constraints, vec![rate_limit_item()]);
            assert_eq!(resp.retry_after_ms, START_MS + 100);
        }
        granted += resp.leases.len();
        shard.advance(Duration::from_millis(10));
    }
    assert!(granted <= 11, "granted {granted} in one window");
    assert_eq!(granted, 11);
}

#[leasekeeper::test]
async fn throttle_allows_burst_then_spaces_grants() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let request = |op: &str, keys: &[&str], now_ms: i64| {
        acquire_builder(account, function, op, keys, now_ms)
            .configuration(throttled(1, 2, 60))
            .constraint(throttle_item())
            .build()
            .unwrap()
    };

    let burst = shard
        .manager
        .acquire(&request("op-1", &["a", "b", "c", "d"], shard.now_ms()))
        .await
        .unwrap();
    assert_eq!(burst.leases.len(), 3);
    assert_eq!(burst.limiting_constraints, vec![throttle_item()]);
    assert_eq!(burst.exhausted_constraints, vec![throttle_item()]);

    let denied = shard
        .manager
        .acquire(&request("op-2", &["d"], shard.now_ms()))
        .await
        .unwrap();
    assert!(denied.leases.is_empty());
    assert_eq!(denied.retry_after_ms, START_MS + 60_000);

    shard.advance(Duration::from_secs(60));
    let spaced = shard
        .manager
        .acquire(&request("op-3", &["d", "e"], shard.now_ms()))
        .await
        .unwrap();
    assert_eq!(spaced.leases.len(), 1);
}

#[leasekeeper::test]
async fn check_reports_usage_without_charging() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let config = ConstraintConfig {
        concurrency: ConcurrencyConfig {
            function_concurrency: 2,
            ..Default::default()
        },
        rate_limit: rate_limited(10, 1).rate_limit,
        ..Default::default()
    };
    let check = CheckRequest::new(account, Uuid::nil(), function)
        .with_configuration(config.clone())
        .with_constraint(ConstraintItem::function_concurrency())
        .with_constraint(rate_limit_item());

    shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-1",
            &["a"],
            2,
            shard.now_ms(),
        ))
        .await
        .unwrap();

    let resp = shard.manager.check(&check).await.unwrap();
    assert_eq!(resp.available_capacity, 1);
    assert!(resp.limiting_constraints.is_empty());
    assert_eq!(resp.fairness_reduction, 0);
    let concurrency = resp
        .usage
        .iter()
        .find(|u| u.constraint == ConstraintItem::function_concurrency())
        .expect("concurrency usage");
    assert_eq!((concurrency.used, concurrency.limit), (1, 2));
    let rate = resp
        .usage
        .iter()
        .find(|u| u.constraint == rate_limit_item())
        .expect("rate limit usage");
    assert_eq!((rate.used, rate.limit), (0, 10));

    // Checking repeatedly charges nothing.
    shard.manager.check(&check).await.unwrap();
    let again = shard.manager.check(&check).await.unwrap();
    assert_eq!(again.available_capacity, 1);

    shard
        .manager
        .acquire(&concurrency_request(
            account,
            function,
            "op-2",
            &["b"],
            2,
            shard.now_ms(),
        ))
        .await
        .unwrap();
    let full = shard.manager.check(&check).await.unwrap();
    assert_eq!(full.available_capacity, 0);
    assert_eq!(full.debug().status, ScriptStatus::LackingCapacity);
    assert_eq!(
        full.limiting_constraints,
        vec![ConstraintItem::function_concurrency()]
    );
    assert_eq!(full.retry_after_ms, shard.now_ms() + 2_000);
}

#[leasekeeper::test]
async fn check_with_idempotency_key_replays_within_ttl() {
    let shard = open_shard();
    let (account, function) = (Uuid::new_v4(), Uuid::new_v4());
    let check = CheckRequest::new(account, Uuid::nil(), function)
        .with_configuration(function_limit(1))
        .with_constraint(ConstraintItem::function_concurrency())
        .with_idempotency_key("chk-1");

    let first = shard.manager.check(&check).await.unwrap();
    assert_eq!(first.available_capacity, 1);

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

    let replayed = shard.manager.check(&check).await.unwrap();
    assert_eq!(replayed.without_debug(), first.without_debug());
    assert_eq!(replayed.debug().status, ScriptStatus::IdempotentReplay);

    shard.advance(Duration::from_millis(1_001));
    let fresh = shard.manager.check(&check).await.unwrap();
    assert_eq!(fresh.available_capacity, 0);
}

#[leasekeeper::test]
async fn env_scoped_constraint_requires_env_id() {
    let shard = open_shard();
    let check = CheckRequest::new(Uuid::new_v4(), Uuid::nil(), Uuid::new_v4()).with_constraint(
        ConstraintItem::Throttle(ThrottleConstraint {
            scope: Scope::Env,
            ..Default::default()
        }),
    );
    let err = shard.manager.check(&check).await.unwrap_err();
    assert!(err.user_error().is_some());
}

#[leasekeeper::test]
async fn function_scoped_limits_keep_separate_cells() {
    let shard = open_shard();
    let account = Uuid::new_v4();
    let (busy, quiet) = (Uuid::new_v4(), Uuid::new_v4());
    let request = |function: Uuid, op: &str, config: ConstraintConfig, item: ConstraintItem| {
        acquire_builder(account, function, op, &[op], START_MS)
            .configuration(config)
            .constraint(item)
            .build()
            .unwrap()
    };

    let mut step = 0;
    loop {
        let op = format!("rl-busy-{step}");
        let resp = shard
            .manager
            .acquire(&request(busy, &op, rate_limited(1, 60), rate_limit_item()))
            .await
            .unwrap();
        if resp.leases.is_empty() {
            break;
        }
        step += 1;
        assert!(step < 5, "rate limit never denied");
    }
    let other = shard
        .manager
        .acquire(&request(
            quiet,
            "rl-quiet",
            rate_limited(1, 60),
            rate_limit_item(),
        ))
        .await
        .unwrap();
    assert_eq!(
        other.leases.len(),
        1,
        "another function has its own rate-limit cell"
    );

    let first = shard
        .manager
        .acquire(&request(
            busy,
            "th-busy-1",
            throttled(1, 0, 60),
            throttle_item(),
        ))
        .await
        .unwrap();
    assert_eq!(first.leases.len(), 1);
    let denied = shard
        .manager
        .acquire(&request(
            busy,
            "th-busy-2",
            throttled(1, 0, 60),
            throttle_item(),
        ))
        .await
        .unwrap();
    assert!(denied.leases.is_empty());
    let other = shard
        .manager
        .acquire(&request(
            quiet,
            "th-quiet",
            throttled(1, 0, 60),
            throttle_item(),
        ))
        .await
        .unwrap();
    assert_eq!(
        other.leases.len(),
        1,
        "another function has its own throttle cell"
    );

    let cells = shard
        .store
        .keys_matching(&format!("{{cs}}:a:{account}:rl:*"));
    assert_eq!(cells.len(), 2, "{cells:?}");
    assert!(cells.iter().any(|k| k.contains(&busy.to_string())));
    assert!(cells.iter().any(|k| k.contains(&quiet.to_string())));
}
