use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use ulid::Ulid;
use uuid::Uuid;

use crate::clock::duration_ms;
use crate::constraint::{sort_constraints, ConstraintItem, SerializedConstraintItem};
use crate::error::{CapacityError, UserError};
use crate::keys::KeyGenerator;
use crate::lifecycle::LeaseAcquiredEvent;
use crate::request::{AcquireRequest, AcquireResponse, DebugState, Lease, ScriptStatus};
use crate::store::{Script, ScriptContext, ScriptError};

use super::evaluate::{
    available_capacity, consume_cells, evaluate_constraints, in_progress_keys,
    refresh_scavenger_entry, replay, UNLIMITED,
};
use super::ShardCapacityManager;

/// A lease the script may create, with its ID chosen up front.
#[derive(Debug, Clone)]
struct Candidate {
    idempotency_key: String,
    lease_id: Ulid,
    run_id: Option<Uuid>,
}

#[derive(Debug)]
struct AcquireScript {
    keys: KeyGenerator,
    account_id: Uuid,
    env_id: Uuid,
    function_id: Uuid,
    request_id: Ulid,
    operation_key: String,
    operation_idempotency_key: String,
    candidates: Vec<Candidate>,
    constraints: Vec<SerializedConstraintItem>,
    source: String,
    request_state: String,
    now_ms: i64,
    expiry_ms: i64,
    deadline_ms: i64,
    operation_ttl_ms: i64,
    constraint_check_ttl_ms: i64,
    request_state_ttl_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AcquireReply {
    s: ScriptStatus,
    rid: Ulid,
    /// Every lease returned: (lease ID, lease idempotency key)
    l: Vec<(Ulid, String)>,
    /// Newly granted lease IDs
    g: Vec<Ulid>,
    lc: Vec<usize>,
    ec: Vec<usize>,
    fr: i64,
    ra: i64,
    #[serde(default)]
    d: Vec<String>,
}

impl AcquireScript {
    /// Live leases of the account, by lease idempotency key.
    fn held_leases(
        &self,
        ctx: &mut ScriptContext<'_>,
    ) -> Result<BTreeMap<String, Ulid>, ScriptError> {
        let lease_index = self.keys.account_leases(self.account_id);
        let mut held = BTreeMap::new();
        for (member, _) in ctx.zrange_by_score(&lease_index, self.now_ms + 1, i64::MAX, None)? {
            let details = self.keys.lease_details(self.account_id, &member);
            let (Some(lik), Ok(id)) = (ctx.hget(&details, "lik")?, member.parse::<Ulid>()) else {
                continue;
            };
            held.insert(lik, id);
        }
        Ok(held)
    }

    fn write_lease(
        &self,
        ctx: &mut ScriptContext<'_>,
        candidate: &Candidate,
        in_progress: &[String],
    ) -> Result<(), ScriptError> {
        let lease_id = candidate.lease_id.to_string();
        let details = self.keys.lease_details(self.account_id, &lease_id);
        ctx.hset(
            &details,
            [
                ("lik", candidate.idempotency_key.clone()),
                ("req", self.request_id.to_string()),
                (
                    "rid",
                    candidate.run_id.map(|r| r.to_string()).unwrap_or_default(),
                ),
                ("oik", self.operation_idempotency_key.clone()),
                ("eid", self.env_id.to_string()),
                ("fid", self.function_id.to_string()),
                ("src", self.source.clone()),
                ("ilks", serde_json::to_string(in_progress)?),
                ("dl", self.deadline_ms.to_string()),
            ],
        )?;
        ctx.zadd(
            &self.keys.account_leases(self.account_id),
            &lease_id,
            self.expiry_ms,
        )?;
        for key in in_progress {
            ctx.zadd(key, &lease_id, self.expiry_ms)?;
        }
        if self.constraint_check_ttl_ms > 0 {
            let cc = self
                .keys
                .constraint_check_idempotency(self.account_id, &candidate.idempotency_key);
            ctx.set(&cc, lease_id, Some(self.constraint_check_ttl_ms));
        }
        Ok(())
    }
}

impl Script for AcquireScript {
    fn name(&self) -> &'static str {
        "acquire"
    }

    fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<Vec<u8>, ScriptError> {
        if let Some(previous) = replay(ctx, &self.operation_key)? {
            return Ok(serde_json::to_vec(&previous)?);
        }
        let mut debug = Vec::new();

        let held = self.held_leases(ctx)?;
        let mut leases = Vec::new();
        let mut wanted = Vec::new();
        for candidate in &self.candidates {
            match held.get(&candidate.idempotency_key) {
                Some(id) => leases.push((*id, candidate.idempotency_key.clone())),
                None => wanted.push(candidate),
            }
        }
        let needed = wanted.len() as i64;
        debug.push(format!("held {} needed {}", leases.len(), needed));

        let states = evaluate_constraints(ctx, &self.constraints, self.now_ms, &mut debug)?;
        let granted = available_capacity(&states).min(needed).max(0);

        let in_progress = in_progress_keys(&self.constraints);
        let mut new_ids = Vec::with_capacity(granted as usize);
        for candidate in wanted.iter().take(granted as usize) {
            self.write_lease(ctx, candidate, &in_progress)?;
            leases.push((candidate.lease_id, candidate.idempotency_key.clone()));
            new_ids.push(candidate.lease_id);
        }
        consume_cells(ctx, &self.constraints, self.now_ms, granted)?;

        if granted > 0 {
            let rs = self
                .keys
                .request_state(self.account_id, &self.request_id.to_string());
            ctx.set(
                &rs,
                self.request_state.clone(),
                Some(self.request_state_ttl_ms),
            );
        }
        refresh_scavenger_entry(
            ctx,
            &self.keys.account_leases(self.account_id),
            &self.keys.scavenger_shard(),
            &self.account_id.to_string(),
        )?;

        let mut limiting = Vec::new();
        let mut exhausted = Vec::new();
        let mut retry_at = 0;
        for (idx, state) in states.iter().enumerate() {
            if state.remaining == UNLIMITED {
                continue;
            }
            if state.remaining < needed {
                limiting.push(idx);
                retry_at = retry_at.max(state.retry_at_ms);
            }
            if state.remaining - granted <= 0 {
                exhausted.push(idx);
            }
        }
        debug.push(format!("granted {granted}"));

        let reply = AcquireReply {
            s: if leases.is_empty() {
                ScriptStatus::LackingCapacity
            } else {
                ScriptStatus::Granted
            },
            rid: self.request_id,
            l: leases,
            g: new_ids,
            lc: limiting,
            ec: exhausted,
            fr: 0,
            ra: retry_at,
            d: debug,
        };
        let encoded = serde_json::to_string(&reply)?;
        ctx.set(
            &self.operation_key,
            encoded.clone(),
            Some(self.operation_ttl_ms),
        );
        Ok(encoded.into_bytes())
    }
}

fn pick(constraints: &[ConstraintItem], indices: &[usize]) -> Vec<ConstraintItem> {
    indices
        .iter()
        .filter_map(|&i| constraints.get(i).cloned())
        .collect()
}

impl ShardCapacityManager {
    pub(crate) fn ensure_fresh(&self, current_time_ms: i64) -> Result<(), UserError> {
        let now = self.clock.now_ms();
        if now > current_time_ms + duration_ms(self.max_allowed_request_delay) {
            return Err(UserError::StaleRequest {
                current_time_ms,
                delay_ms: now - current_time_ms,
            });
        }
        Ok(())
    }

    /// Sorts the request's constraints into evaluation order and resolves their limits.
    pub(crate) fn prepare_constraints(
        &self,
        constraints: &[ConstraintItem],
        configuration: &crate::constraint::ConstraintConfig,
        account_id: Uuid,
        env_id: Uuid,
        function_id: Uuid,
    ) -> Result<(Vec<ConstraintItem>, Vec<SerializedConstraintItem>), UserError> {
        let mut sorted = constraints.to_vec();
        sort_constraints(&mut sorted);
        let mut seen = HashSet::new();
        sorted.retain(|item| seen.insert(item.clone()));
        let serialized = sorted
            .iter()
            .map(|item| item.serialize(configuration, &self.keys, account_id, env_id, function_id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((sorted, serialized))
    }

    #[instrument(skip_all, fields(shard = %self.name, account_id = %req.account_id))]
    pub async fn acquire(&self, req: &AcquireRequest) -> Result<AcquireResponse, CapacityError> {
        req.validate()?;
        self.ensure_fresh(req.current_time_ms)?;
        let (constraints, serialized) = self.prepare_constraints(
            &req.constraints,
            &req.configuration,
            req.account_id,
            req.env_id,
            req.function_id,
        )?;

        if let Some(cache) = &self.acquire_cache {
            if let Some(cached) = cache.get(req.account_id, req.function_id, &constraints) {
                if let Some(m) = &self.metrics {
                    m.record_cache_hit("acquire_response");
                }
                debug!("serving cached acquire response");
                return Ok(cached);
            }
        }

        let now_ms = self.clock.now_ms();
        let expiry_ms = now_ms + duration_ms(req.duration);
        let request_state = serde_json::json!({
            "s": serialized,
            "cv": req.configuration.function_version,
            "aid": req.account_id,
            "eid": req.env_id,
            "fid": req.function_id,
            "src": req.source,
            "mi": req.migration,
        });
        let script = AcquireScript {
            keys: self.keys.clone(),
            account_id: req.account_id,
            env_id: req.env_id,
            function_id: req.function_id,
            request_id: Ulid::from_parts(now_ms as u64, rand::random()),
            operation_key: self.keys.operation_idempotency(
                req.account_id,
                "acq",
                &req.idempotency_key,
            ),
            operation_idempotency_key: req.idempotency_key.clone(),
            candidates: req
                .lease_idempotency_keys
                .iter()
                .map(|key| Candidate {
                    idempotency_key: key.clone(),
                    lease_id: Ulid::from_parts(expiry_ms as u64, rand::random()),
                    run_id: req.lease_run_ids.get(key).copied(),
                })
                .collect(),
            constraints: serialized,
            source: serde_json::to_string(&req.source)
                .map_err(crate::error::InternalError::from)?,
            request_state: request_state.to_string(),
            now_ms,
            expiry_ms,
            deadline_ms: now_ms + duration_ms(req.maximum_lifetime),
            operation_ttl_ms: duration_ms(self.operation_idempotency_ttl),
            constraint_check_ttl_ms: duration_ms(self.constraint_check_idempotency_ttl),
            request_state_ttl_ms: duration_ms(req.maximum_lifetime),
        };
        let reply: AcquireReply = self.run_script("acquire", &script).await?;
        self.log_debug_lines("acquire", req.account_id, &reply.d);

        let response = AcquireResponse {
            request_id: Some(reply.rid),
            leases: reply
                .l
                .iter()
                .map(|(lease_id, key)| Lease {
                    lease_id: *lease_id,
                    idempotency_key: key.clone(),
                })
                .collect(),
            limiting_constraints: pick(&constraints, &reply.lc),
            exhausted_constraints: pick(&constraints, &reply.ec),
            fairness_reduction: reply.fr,
            retry_after_ms: reply.ra,
            debug: DebugState {
                status: reply.s,
                lines: reply.d,
            },
        };

        if let Some(m) = &self.metrics {
            let outcome = match reply.s {
                ScriptStatus::Granted => "granted",
                ScriptStatus::LackingCapacity => "lacking_capacity",
                ScriptStatus::IdempotentReplay => "replay",
            };
            m.record_acquire_outcome(&self.name, outcome);
        }

        if reply.s != ScriptStatus::IdempotentReplay && !reply.g.is_empty() {
            self.record_leases(req.account_id, "acquired", reply.g.len());
            let granted: HashSet<Ulid> = reply.g.iter().copied().collect();
            let event = LeaseAcquiredEvent {
                shard: self.name.clone(),
                account_id: req.account_id,
                env_id: req.env_id,
                function_id: req.function_id,
                request_id: reply.rid,
                leases: response
                    .leases
                    .iter()
                    .filter(|l| granted.contains(&l.lease_id))
                    .cloned()
                    .collect(),
                source: req.source,
                constraints: constraints.clone(),
                limiting_constraints: response.limiting_constraints.clone(),
            };
            self.lifecycles.acquired(&event).await;
        }

        if let Some(cache) = &self.acquire_cache {
            cache.put(req.account_id, req.function_id, &response);
        }
        Ok(response)
    }
}
