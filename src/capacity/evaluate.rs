//! Constraint evaluation and bookkeeping shared by the capacity scripts. Everything here
//! runs inside a script, against a [`ScriptContext`].

use crate::constraint::SerializedConstraintItem;
use crate::store::{ScriptContext, ScriptError};

use super::gcra::Gcra;

/// Remaining capacity of a constraint without a positive limit.
pub(super) const UNLIMITED: i64 = i64::MAX;

/// Point-in-time state of one constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct ConstraintState {
    pub(super) remaining: i64,
    pub(super) used: i64,
    /// 0 when unlimited
    pub(super) limit: i64,
    /// Earliest time (unix ms) at which one more unit may become available
    pub(super) retry_at_ms: i64,
}

impl ConstraintState {
    fn unlimited(used: i64) -> Self {
        Self {
            remaining: UNLIMITED,
            used,
            limit: 0,
            retry_at_ms: 0,
        }
    }
}

fn us_to_ms_ceil(us: i64) -> i64 {
    (us + 999).div_euclid(1_000)
}

fn read_tat(ctx: &mut ScriptContext<'_>, key: &str) -> Result<Option<i64>, ScriptError> {
    Ok(ctx.get(key)?.and_then(|v| v.parse().ok()))
}

/// Evaluates every constraint in order. A lease counts against a concurrency constraint
/// while its in-progress score is in the future.
pub(super) fn evaluate_constraints(
    ctx: &mut ScriptContext<'_>,
    items: &[SerializedConstraintItem],
    now_ms: i64,
    debug: &mut Vec<String>,
) -> Result<Vec<ConstraintState>, ScriptError> {
    let now_us = now_ms.saturating_mul(1_000);
    let mut states = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let state = if let Some(c) = &item.concurrency {
            let used = ctx.zcount(&c.in_progress_key, now_ms + 1, i64::MAX)? as i64;
            if c.limit <= 0 {
                ConstraintState::unlimited(used)
            } else {
                let next_expiry = ctx
                    .zrange_by_score(&c.in_progress_key, now_ms + 1, i64::MAX, Some(1))?
                    .first()
                    .map(|(_, score)| *score);
                let fallback = now_ms + c.retry_after_ms;
                ConstraintState {
                    remaining: (c.limit - used).max(0),
                    used,
                    limit: c.limit,
                    retry_at_ms: next_expiry.map_or(fallback, |at| at.min(fallback)),
                }
            }
        } else if let Some(r) = &item.rate_limit {
            match Gcra::rate_limit(r.limit, r.period_ms) {
                None => ConstraintState::unlimited(0),
                Some(g) => {
                    let tat = read_tat(ctx, &r.key)?;
                    ConstraintState {
                        remaining: g.capacity(now_us, tat),
                        used: g.used(now_us, tat),
                        limit: r.limit,
                        retry_at_ms: us_to_ms_ceil(g.retry_at_us(now_us, tat)),
                    }
                }
            }
        } else if let Some(t) = &item.throttle {
            match Gcra::throttle(t.limit, t.burst, t.period_ms) {
                None => ConstraintState::unlimited(0),
                Some(g) => {
                    let tat = read_tat(ctx, &t.key)?;
                    ConstraintState {
                        remaining: g.capacity(now_us, tat),
                        used: g.used(now_us, tat),
                        limit: t.limit,
                        retry_at_ms: us_to_ms_ceil(g.retry_at_us(now_us, tat)),
                    }
                }
            }
        } else {
            return Err(ScriptError::InvalidArgument(format!(
                "constraint {idx} of kind {} has no body",
                item.kind
            )));
        };
        debug.push(format!(
            "constraint {idx} kind {} used {} limit {} remaining {}",
            item.kind,
            state.used,
            state.limit,
            if state.remaining == UNLIMITED {
                "unlimited".to_string()
            } else {
                state.remaining.to_string()
            }
        ));
        states.push(state);
    }
    Ok(states)
}

/// Smallest remaining capacity across all constraints.
pub(super) fn available_capacity(states: &[ConstraintState]) -> i64 {
    states
        .iter()
        .map(|s| s.remaining)
        .min()
        .unwrap_or(UNLIMITED)
}

/// Charges `units` against every rate limit and throttle cell.
pub(super) fn consume_cells(
    ctx: &mut ScriptContext<'_>,
    items: &[SerializedConstraintItem],
    now_ms: i64,
    units: i64,
) -> Result<(), ScriptError> {
    if units <= 0 {
        return Ok(());
    }
    let now_us = now_ms.saturating_mul(1_000);
    for item in items {
        let cell = match (&item.rate_limit, &item.throttle) {
            (Some(r), _) => Gcra::rate_limit(r.limit, r.period_ms).map(|g| (g, r.key.as_str())),
            (_, Some(t)) => {
                Gcra::throttle(t.limit, t.burst, t.period_ms).map(|g| (g, t.key.as_str()))
            }
            _ => None,
        };
        if let Some((g, key)) = cell {
            let tat = read_tat(ctx, key)?;
            let next = g.consume(now_us, tat, units);
            ctx.set(key, next.to_string(), Some(g.ttl_ms(now_us, next)));
        }
    }
    Ok(())
}

/// In-progress sets a new lease is added to.
pub(super) fn in_progress_keys(items: &[SerializedConstraintItem]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.concurrency.as_ref())
        .map(|c| c.in_progress_key.clone())
        .collect()
}

/// Points the account's scavenger entry at its earliest lease, or drops it when the
/// account holds none.
pub(super) fn refresh_scavenger_entry(
    ctx: &mut ScriptContext<'_>,
    lease_index: &str,
    scavenger_shard: &str,
    account: &str,
) -> Result<(), ScriptError> {
    match ctx.zfirst(lease_index)? {
        Some((_, earliest)) => {
            ctx.zadd(scavenger_shard, account, earliest)?;
        }
        None => {
            ctx.zrem(scavenger_shard, account)?;
        }
    }
    Ok(())
}

/// Returns the stored reply for an idempotency record, re-tagged as a replay.
pub(super) fn replay(
    ctx: &mut ScriptContext<'_>,
    key: &str,
) -> Result<Option<serde_json::Value>, ScriptError> {
    let Some(raw) = ctx.get(key)? else {
        return Ok(None);
    };
    let mut value: serde_json::Value = serde_json::from_str(&raw)?;
    if let Some(obj) = value.as_object_mut() {
        obj.insert("s".to_string(), serde_json::Value::from(3u8));
    }
    Ok(Some(value))
}
