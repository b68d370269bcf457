use serde::{Deserialize, Serialize};
use tracing::instrument;
use ulid::Ulid;
use uuid::Uuid;

use crate::clock::duration_ms;
use crate::error::CapacityError;
use crate::keys::KeyGenerator;
use crate::lifecycle::LeaseReleasedEvent;
use crate::request::{DebugState, LeaseSource, ReleaseRequest, ReleaseResponse, ScriptStatus};
use crate::store::{Script, ScriptContext, ScriptError};

use super::evaluate::{refresh_scavenger_entry, replay};
use super::ShardCapacityManager;

#[derive(Debug)]
struct ReleaseScript {
    keys: KeyGenerator,
    account_id: Uuid,
    lease_id: Ulid,
    operation_key: String,
    operation_ttl_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReleaseReply {
    s: ScriptStatus,
    #[serde(default)]
    eid: Option<Uuid>,
    #[serde(default)]
    fid: Option<Uuid>,
    #[serde(default)]
    src: Option<LeaseSource>,
    #[serde(default)]
    d: Vec<String>,
}

fn parse_uuid(raw: Option<&String>) -> Option<Uuid> {
    raw.and_then(|v| Uuid::parse_str(v).ok())
}

impl Script for ReleaseScript {
    fn name(&self) -> &'static str {
        "release"
    }

    fn run(&self, ctx: &mut ScriptContext<'_>) -> Result<Vec<u8>, ScriptError> {
        if let Some(previous) = replay(ctx, &self.operation_key)? {
            return Ok(serde_json::to_vec(&previous)?);
        }
        let lease_id = self.lease_id.to_string();
        let lease_index = self.keys.account_leases(self.account_id);
        let details_key = self.keys.lease_details(self.account_id, &lease_id);
        let details = ctx.hgetall(&details_key)?;
        if details.is_empty() {
            // Heal an index entry left without details.
            if ctx.zrem(&lease_index, &lease_id)? {
                refresh_scavenger_entry(
                    ctx,
                    &lease_index,
                    &self.keys.scavenger_shard(),
                    &self.account_id.to_string(),
                )?;
            }
            return Ok(serde_json::to_vec(&ReleaseReply {
                s: ScriptStatus::LackingCapacity,
                eid: None,
                fid: None,
                src: None,
                d: vec![format!("lease {lease_id} not found")],
            })?);
        }

        let in_progress: Vec<String> = match details.get("ilks") {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw)?,
            _ => Vec::new(),
        };
        ctx.zrem(&lease_index, &lease_id)?;
        for key in &in_progress {
            ctx.zrem(key, &lease_id)?;
        }
        ctx.del(&details_key);
        refresh_scavenger_entry(
            ctx,
            &lease_index,
            &self.keys.scavenger_shard(),
            &self.account_id.to_string(),
        )?;

        let reply = ReleaseReply {
            s: ScriptStatus::Granted,
            eid: parse_uuid(details.get("eid")),
            fid: parse_uuid(details.get("fid")),
            src: details
                .get("src")
                .and_then(|raw| serde_json::from_str(raw).ok()),
            d: vec![format!(
                "lease {lease_id} released from {} in-progress sets",
                in_progress.len()
            )],
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
    /// Removes a lease, expired or not. Releasing a lease that no longer exists succeeds
    /// with an empty response.
    #[instrument(skip_all, fields(shard = %self.name, account_id = %req.account_id, lease_id = %req.lease_id))]
    pub async fn release(&self, req: &ReleaseRequest) -> Result<ReleaseResponse, CapacityError> {
        req.validate()?;
        let script = ReleaseScript {
            keys: self.keys.clone(),
            account_id: req.account_id,
            lease_id: req.lease_id,
            operation_key: self.keys.operation_idempotency(
                req.account_id,
                "rel",
                &req.idempotency_key,
            ),
            operation_ttl_ms: duration_ms(self.operation_idempotency_ttl),
        };
        let reply: ReleaseReply = self.run_script("release", &script).await?;
        self.log_debug_lines("release", req.account_id, &reply.d);

        let response = ReleaseResponse {
            account_id: req.account_id,
            env_id: reply.eid.unwrap_or_default(),
            function_id: reply.fid.unwrap_or_default(),
            creation_source: reply.src.unwrap_or_default(),
            debug: DebugState {
                status: reply.s,
                lines: reply.d,
            },
        };
        if reply.s == ScriptStatus::Granted {
            self.record_leases(req.account_id, "released", 1);
            let event = LeaseReleasedEvent {
                shard: self.name.clone(),
                account_id: req.account_id,
                env_id: response.env_id,
                function_id: response.function_id,
                lease_id: req.lease_id,
                creation_source: response.creation_source,
                release_source: req.source,
            };
            self.lifecycles.released(&event).await;
        }
        Ok(response)
    }
}
