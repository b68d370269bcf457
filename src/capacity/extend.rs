use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::instrument;
use ulid::Ulid;
use uuid::Uuid;

use crate::clock::duration_ms;
use crate::error::CapacityError;
use crate::keys::KeyGenerator;
use crate::lifecycle::LeaseExtendedEvent;
use crate::request::{DebugState, ExtendLeaseRequest, ExtendLeaseResponse, ScriptStatus};
use crate::store::{Script, ScriptContext, ScriptError};

use super::evaluate::{refresh_scavenger_entry, replay};
use super::ShardCapacityManager;

#[derive(Debug)]
struct ExtendScript {
    keys: KeyGenerator,
    account_id: Uuid,
    lease_id: Ulid,
    new_lease_id: Ulid,
    new_expiry_ms: i64,
    operation_key: String,
    operation_ttl_ms: i64,
    now_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExtendReply {
    s: ScriptStatus,
    l: Option<Ulid>,
    #[serde(default)]
    d: Vec<String>,
}

impl ExtendScript {
    fn missing(reason: String) -> Result<Vec<u8>, ScriptError> {
        Ok(serde_json::to_vec(&ExtendReply {
            s: ScriptStatus::LackingCapacity,
            l: None,
            d: vec![reason],
        })?)
    }

    fn in_progress_keys(details: &BTreeMap<String, String>) -> Result<Vec<String>, ScriptError> {
        match details.get("ilks") {
            Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
            _ => Ok(Vec::new()),
        }
    }
}

impl Script for ExtendScript {
    fn name(&self) -> &'static str {
        "extend"
    }

    fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<Vec<u8>, ScriptError> {
        if let Some(previous) = replay(ctx, &self.operation_key)? {
            return Ok(serde_json::to_vec(&previous)?);
        }
        let old_id = self.lease_id.to_string();
        let lease_index = self.keys.account_leases(self.account_id);
        match ctx.zscore(&lease_index, &old_id)? {
            Some(expiry) if expiry > self.now_ms => {}
            Some(_) => return Self::missing(format!("lease {old_id} already expired")),
            None => return Self::missing(format!("lease {old_id} not found")),
        }
        let old_details = self.keys.lease_details(self.account_id, &old_id);
        let details = ctx.hgetall(&old_details)?;
        if details.is_empty() {
            return Self::missing(format!("lease {old_id} has no details"));
        }
        let deadline = details
            .get("dl")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(i64::MAX);
        if self.new_expiry_ms > deadline {
            return Self::missing(format!(
                "lease {old_id} cannot outlive its maximum lifetime ending at {deadline}"
            ));
        }

        let new_id = self.new_lease_id.to_string();
        let in_progress = Self::in_progress_keys(&details)?;
        ctx.del(&old_details);
        ctx.hset(&self.keys.lease_details(self.account_id, &new_id), details)?;
        ctx.zrem(&lease_index, &old_id)?;
        ctx.zadd(&lease_index, &new_id, self.new_expiry_ms)?;
        for key in &in_progress {
            if ctx.zrem(key, &old_id)? {
                ctx.zadd(key, &new_id, self.new_expiry_ms)?;
            }
        }
        refresh_scavenger_entry(
            ctx,
            &lease_index,
            &self.keys.scavenger_shard(),
            &self.account_id.to_string(),
        )?;

        let reply = ExtendReply {
            s: ScriptStatus::Granted,
            l: Some(self.new_lease_id),
            d: vec![format!("lease {old_id} extended to {new_id}")],
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

impl ShardCapacityManager {
    /// Moves a live lease to a new ID expiring `duration` from now. Unknown, released and
    /// expired leases yield an empty response.
    #[instrument(skip_all, fields(shard = %self.name, account_id = %req.account_id, lease_id = %req.lease_id))]
    pub async fn extend_lease(
        &self,
        req: &ExtendLeaseRequest,
    ) -> Result<ExtendLeaseResponse, CapacityError> {
        req.validate()?;
        let now_ms = self.clock.now_ms();
        let new_expiry_ms = now_ms + duration_ms(req.duration);
        let script = ExtendScript {
            keys: self.keys.clone(),
            account_id: req.account_id,
            lease_id: req.lease_id,
            new_lease_id: Ulid::from_parts(new_expiry_ms as u64, rand::random()),
            new_expiry_ms,
            operation_key: self.keys.operation_idempotency(
                req.account_id,
                "ext",
                &req.idempotency_key,
            ),
            operation_ttl_ms: duration_ms(self.operation_idempotency_ttl),
            now_ms,
        };
        let reply: ExtendReply = self.run_script("extend", &script).await?;
        self.log_debug_lines("extend", req.account_id, &reply.d);

        if reply.s == ScriptStatus::Granted {
            if let Some(lease_id) = reply.l {
                self.record_leases(req.account_id, "extended", 1);
                let event = LeaseExtendedEvent {
                    shard: self.name.clone(),
                    account_id: req.account_id,
                    previous_lease_id: req.lease_id,
                    lease_id,
                    duration: req.duration,
                };
                self.lifecycles.extended(&event).await;
            }
        }
        Ok(ExtendLeaseResponse {
            lease_id: reply.l,
            debug: DebugState {
                status: reply.s,
                lines: reply.d,
            },
        })
    }
}
