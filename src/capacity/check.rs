use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::clock::duration_ms;
use crate::constraint::SerializedConstraintItem;
use crate::error::CapacityError;
use crate::request::{CheckRequest, CheckResponse, ConstraintUsage, DebugState, ScriptStatus};
use crate::store::{Script, ScriptContext, ScriptError};

use super::evaluate::{available_capacity, evaluate_constraints, replay, UNLIMITED};
use super::ShardCapacityManager;

/// Evaluates constraints without charging them. The only write is the optional
/// idempotency record.
#[derive(Debug)]
struct CheckScript {
    operation_key: Option<String>,
    constraints: Vec<SerializedConstraintItem>,
    now_ms: i64,
    idempotency_ttl_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckReply {
    s: ScriptStatus,
    a: i64,
    lc: Vec<usize>,
    /// (used, limit) per constraint
    u: Vec<(i64, i64)>,
    fr: i64,
    ra: i64,
    #[serde(default)]
    d: Vec<String>,
}

impl Script for CheckScript {
    fn name(&self) -> &'static str {
        "check"
    }

    fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<Vec<u8>, ScriptError> {
        if let Some(key) = &self.operation_key {
            if let Some(previous) = replay(ctx, key)? {
                return Ok(serde_json::to_vec(&previous)?);
            }
        }
        let mut debug = Vec::new();
        let states = evaluate_constraints(ctx, &self.constraints, self.now_ms, &mut debug)?;
        let available = available_capacity(&states);

        let mut limiting = Vec::new();
        let mut retry_at = 0;
        for (idx, state) in states.iter().enumerate() {
            if state.remaining != UNLIMITED && state.remaining == 0 {
                limiting.push(idx);
                retry_at = retry_at.max(state.retry_at_ms);
            }
        }
        let reply = CheckReply {
            s: if available > 0 {
                ScriptStatus::Granted
            } else {
                ScriptStatus::LackingCapacity
            },
            a: available,
            lc: limiting,
            u: states.iter().map(|s| (s.used, s.limit)).collect(),
            fr: 0,
            ra: retry_at,
            d: debug,
        };
        let encoded = serde_json::to_string(&reply)?;
        if let Some(key) = &self.operation_key {
            if self.idempotency_ttl_ms > 0 {
                ctx.set(key, encoded.clone(), Some(self.idempotency_ttl_ms));
            }
        }
        Ok(encoded.into_bytes())
    }
}

impl ShardCapacityManager {
    #[instrument(skip_all, fields(shard = %self.name, account_id = %req.account_id))]
    pub async fn check(&self, req: &CheckRequest) -> Result<CheckResponse, CapacityError> {
        req.validate()?;
        let (constraints, serialized) = self.prepare_constraints(
            &req.constraints,
            &req.configuration,
            req.account_id,
            req.env_id,
            req.function_id,
        )?;
        let script = CheckScript {
            operation_key: req
                .idempotency_key
                .as_deref()
                .map(|key| self.keys.operation_idempotency(req.account_id, "chk", key)),
            constraints: serialized,
            now_ms: self.clock.now_ms(),
            idempotency_ttl_ms: duration_ms(self.check_idempotency_ttl),
        };
        let reply: CheckReply = self.run_script("check", &script).await?;
        self.log_debug_lines("check", req.account_id, &reply.d);

        Ok(CheckResponse {
            available_capacity: reply.a,
            limiting_constraints: reply
                .lc
                .iter()
                .filter_map(|&i| constraints.get(i).cloned())
                .collect(),
            usage: constraints
                .iter()
                .zip(reply.u.iter())
                .map(|(constraint, &(used, limit))| ConstraintUsage {
                    constraint: constraint.clone(),
                    used,
                    limit,
                })
                .collect(),
            fairness_reduction: reply.fr,
            retry_after_ms: reply.ra,
            debug: DebugState {
                status: reply.s,
                lines: reply.d,
            },
        })
    }
}
