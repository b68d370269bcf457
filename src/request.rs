//! Request and response value types plus their builders.
//!
//! Builders validate structure only. Time-dependent checks (stale requests) and
//! configuration matching happen in the capacity manager, which owns the clock.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

use crate::constraint::{ConstraintConfig, ConstraintItem, Scope};
use crate::error::UserError;

/// Origin service of a lease.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseService {
    #[default]
    Unknown,
    NewRuns,
    Executor,
    Api,
    ConstraintScavenger,
}

impl fmt::Display for LeaseService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeaseService::Unknown => "unknown",
            LeaseService::NewRuns => "new_runs",
            LeaseService::Executor => "executor",
            LeaseService::Api => "api",
            LeaseService::ConstraintScavenger => "constraint-scavenger",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle step that asked for capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerLocation {
    #[default]
    Unknown,
    Schedule,
    BacklogRefill,
    ItemLease,
    Checkpoint,
    LeaseScavenge,
}

impl fmt::Display for CallerLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallerLocation::Unknown => "unknown",
            CallerLocation::Schedule => "schedule",
            CallerLocation::BacklogRefill => "backlog_refill",
            CallerLocation::ItemLease => "item_lease",
            CallerLocation::Checkpoint => "checkpoint",
            CallerLocation::LeaseScavenge => "lease_scavenge",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunProcessingMode {
    #[default]
    Background,
    DurableEndpoint,
}

impl fmt::Display for RunProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunProcessingMode::Background => write!(f, "background"),
            RunProcessingMode::DurableEndpoint => write!(f, "durable_endpoint"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseSource {
    #[serde(default)]
    pub service: LeaseService,
    #[serde(default)]
    pub location: CallerLocation,
    #[serde(default)]
    pub run_processing_mode: RunProcessingMode,
}

impl LeaseSource {
    pub fn scavenger() -> Self {
        Self {
            service: LeaseService::ConstraintScavenger,
            location: CallerLocation::LeaseScavenge,
            run_processing_mode: RunProcessingMode::Background,
        }
    }
}

/// Hints carried for callers still splitting state across stores. Recorded in request
/// state; routing does not depend on them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationIdentifier {
    #[serde(default)]
    pub is_rate_limit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_shard: Option<String>,
}

/// Outcome recorded by every script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ScriptStatus {
    #[default]
    Granted,
    LackingCapacity,
    IdempotentReplay,
}

impl From<ScriptStatus> for u8 {
    fn from(s: ScriptStatus) -> u8 {
        match s {
            ScriptStatus::Granted => 1,
            ScriptStatus::LackingCapacity => 2,
            ScriptStatus::IdempotentReplay => 3,
        }
    }
}

impl TryFrom<u8> for ScriptStatus {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(ScriptStatus::Granted),
            2 => Ok(ScriptStatus::LackingCapacity),
            3 => Ok(ScriptStatus::IdempotentReplay),
            other => Err(format!("unknown script status {other}")),
        }
    }
}

/// Internal state of the script that produced a response. Never persisted; compare
/// responses through `without_debug` to ignore it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugState {
    pub status: ScriptStatus,
    pub lines: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: Ulid,
    pub idempotency_key: String,
}

impl Lease {
    /// Expiry in unix ms, embedded in the lease ID
    pub fn expires_at_ms(&self) -> i64 {
        self.lease_id.timestamp_ms() as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquireRequest {
    pub idempotency_key: String,
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub function_id: Uuid,
    pub amount: usize,
    /// One key per requested lease
    pub lease_idempotency_keys: Vec<String>,
    /// Optional run IDs by lease idempotency key
    #[serde(default)]
    pub lease_run_ids: BTreeMap<String, Uuid>,
    pub duration: Duration,
    pub maximum_lifetime: Duration,
    /// Caller's notion of now, unix ms
    pub current_time_ms: i64,
    pub source: LeaseSource,
    pub configuration: ConstraintConfig,
    pub constraints: Vec<ConstraintItem>,
    #[serde(default)]
    pub migration: MigrationIdentifier,
}

impl AcquireRequest {
    pub fn builder(account_id: Uuid, idempotency_key: impl Into<String>) -> AcquireRequestBuilder {
        AcquireRequestBuilder::new(account_id, idempotency_key)
    }

    pub fn validate(&self) -> Result<(), UserError> {
        if self.account_id.is_nil() {
            return Err(malformed("missing account id"));
        }
        if self.idempotency_key.is_empty() {
            return Err(malformed("missing idempotency key"));
        }
        if self.amount == 0 {
            return Err(malformed("amount must be at least 1"));
        }
        if self.lease_idempotency_keys.len() != self.amount {
            return Err(malformed(format!(
                "expected {} lease idempotency keys, got {}",
                self.amount,
                self.lease_idempotency_keys.len()
            )));
        }
        let mut seen = HashSet::new();
        for key in &self.lease_idempotency_keys {
            if key.is_empty() {
                return Err(malformed("empty lease idempotency key"));
            }
            if !seen.insert(key.as_str()) {
                return Err(malformed(format!("duplicate lease idempotency key {key}")));
            }
        }
        if self.duration.is_zero() {
            return Err(malformed("lease duration must be positive"));
        }
        if self.maximum_lifetime < self.duration {
            return Err(malformed(
                "maximum lifetime is shorter than the lease duration",
            ));
        }
        validate_constraint_entities(&self.constraints, self.env_id, self.function_id)
    }
}

fn malformed(msg: impl Into<String>) -> UserError {
    UserError::MalformedRequest(msg.into())
}

fn validate_constraint_entities(
    constraints: &[ConstraintItem],
    env_id: Uuid,
    function_id: Uuid,
) -> Result<(), UserError> {
    for item in constraints {
        match item.scope() {
            Scope::Fn if function_id.is_nil() => {
                return Err(malformed(format!(
                    "{} constraint scoped to a function requires a function id",
                    item.kind()
                )))
            }
            Scope::Env if env_id.is_nil() => {
                return Err(malformed(format!(
                    "{} constraint scoped to an environment requires an env id",
                    item.kind()
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct AcquireRequestBuilder {
    req: AcquireRequest,
}

impl AcquireRequestBuilder {
    fn new(account_id: Uuid, idempotency_key: impl Into<String>) -> Self {
        Self {
            req: AcquireRequest {
                idempotency_key: idempotency_key.into(),
                account_id,
                env_id: Uuid::nil(),
                function_id: Uuid::nil(),
                amount: 0,
                lease_idempotency_keys: Vec::new(),
                lease_run_ids: BTreeMap::new(),
                duration: Duration::from_secs(5),
                maximum_lifetime: Duration::from_secs(60),
                current_time_ms: 0,
                source: LeaseSource::default(),
                configuration: ConstraintConfig::default(),
                constraints: Vec::new(),
                migration: MigrationIdentifier::default(),
            },
        }
    }

    pub fn env_id(mut self, env_id: Uuid) -> Self {
        self.req.env_id = env_id;
        self
    }

    pub fn function_id(mut self, function_id: Uuid) -> Self {
        self.req.function_id = function_id;
        self
    }

    /// Adds one requested lease.
    pub fn lease(mut self, idempotency_key: impl Into<String>) -> Self {
        self.req.lease_idempotency_keys.push(idempotency_key.into());
        self.req.amount = self.req.lease_idempotency_keys.len();
        self
    }

    /// Adds one requested lease tied to a run.
    pub fn lease_for_run(mut self, idempotency_key: impl Into<String>, run_id: Uuid) -> Self {
        let key = idempotency_key.into();
        self.req.lease_run_ids.insert(key.clone(), run_id);
        self.lease(key)
    }

    /// Overrides the amount; the request is malformed unless it matches the lease keys.
    pub fn amount(mut self, amount: usize) -> Self {
        self.req.amount = amount;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.req.duration = duration;
        self
    }

    pub fn maximum_lifetime(mut self, lifetime: Duration) -> Self {
        self.req.maximum_lifetime = lifetime;
        self
    }

    pub fn current_time_ms(mut self, now_ms: i64) -> Self {
        self.req.current_time_ms = now_ms;
        self
    }

    pub fn source(mut self, source: LeaseSource) -> Self {
        self.req.source = source;
        self
    }

    pub fn configuration(mut self, configuration: ConstraintConfig) -> Self {
        self.req.configuration = configuration;
        self
    }

    pub fn constraint(mut self, item: ConstraintItem) -> Self {
        self.req.constraints.push(item);
        self
    }

    pub fn migration(mut self, migration: MigrationIdentifier) -> Self {
        self.req.migration = migration;
        self
    }

    pub fn build(self) -> Result<AcquireRequest, UserError> {
        self.req.validate()?;
        Ok(self.req)
    }

    /// Skips validation; for exercising manager-side checks.
    pub fn build_unchecked(self) -> AcquireRequest {
        self.req
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub request_id: Option<Ulid>,
    pub leases: Vec<Lease>,
    pub limiting_constraints: Vec<ConstraintItem>,
    pub exhausted_constraints: Vec<ConstraintItem>,
    pub fairness_reduction: i64,
    /// Unix ms; 0 when unknown
    pub retry_after_ms: i64,
    #[serde(skip)]
    pub(crate) debug: DebugState,
}

impl AcquireResponse {
    pub fn debug(&self) -> &DebugState {
        &self.debug
    }

    /// The caller-visible outcome, with the script state cleared.
    pub fn without_debug(&self) -> Self {
        Self {
            debug: DebugState::default(),
            ..self.clone()
        }
    }

    /// A response that grants nothing and asks the caller to come back at `retry_after_ms`.
    pub fn retry_at(retry_after_ms: i64) -> Self {
        Self {
            retry_after_ms,
            debug: DebugState {
                status: ScriptStatus::LackingCapacity,
                lines: Vec::new(),
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    /// Optional; enables replay within the check idempotency TTL
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub function_id: Uuid,
    pub configuration: ConstraintConfig,
    pub constraints: Vec<ConstraintItem>,
    #[serde(default)]
    pub migration: MigrationIdentifier,
}

impl CheckRequest {
    pub fn new(account_id: Uuid, env_id: Uuid, function_id: Uuid) -> Self {
        Self {
            idempotency_key: None,
            account_id,
            env_id,
            function_id,
            configuration: ConstraintConfig::default(),
            constraints: Vec::new(),
            migration: MigrationIdentifier::default(),
        }
    }

    pub fn with_configuration(mut self, configuration: ConstraintConfig) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn with_constraint(mut self, item: ConstraintItem) -> Self {
        self.constraints.push(item);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> Result<(), UserError> {
        if self.account_id.is_nil() {
            return Err(malformed("missing account id"));
        }
        if self.idempotency_key.as_deref() == Some("") {
            return Err(malformed("empty idempotency key"));
        }
        validate_constraint_entities(&self.constraints, self.env_id, self.function_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintUsage {
    pub constraint: ConstraintItem,
    pub used: i64,
    /// 0 when unlimited
    pub limit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub available_capacity: i64,
    pub limiting_constraints: Vec<ConstraintItem>,
    pub usage: Vec<ConstraintUsage>,
    pub fairness_reduction: i64,
    pub retry_after_ms: i64,
    #[serde(skip)]
    pub(crate) debug: DebugState,
}

impl CheckResponse {
    pub fn debug(&self) -> &DebugState {
        &self.debug
    }

    /// The caller-visible outcome, with the script state cleared.
    pub fn without_debug(&self) -> Self {
        Self {
            debug: DebugState::default(),
            ..self.clone()
        }
    }

    pub fn retry_at(retry_after_ms: i64) -> Self {
        Self {
            retry_after_ms,
            debug: DebugState {
                status: ScriptStatus::LackingCapacity,
                lines: Vec::new(),
            },
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendLeaseRequest {
    pub idempotency_key: String,
    pub account_id: Uuid,
    pub lease_id: Ulid,
    pub duration: Duration,
    #[serde(default)]
    pub migration: MigrationIdentifier,
}

impl ExtendLeaseRequest {
    pub fn new(
        account_id: Uuid,
        lease_id: Ulid,
        duration: Duration,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            account_id,
            lease_id,
            duration,
            migration: MigrationIdentifier::default(),
        }
    }

    pub fn validate(&self) -> Result<(), UserError> {
        if self.account_id.is_nil() {
            return Err(malformed("missing account id"));
        }
        if self.idempotency_key.is_empty() {
            return Err(malformed("missing idempotency key"));
        }
        if self.duration.is_zero() {
            return Err(malformed("lease duration must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtendLeaseResponse {
    /// The replacement lease; `None` when the lease no longer exists
    pub lease_id: Option<Ulid>,
    #[serde(skip)]
    pub(crate) debug: DebugState,
}

impl ExtendLeaseResponse {
    pub fn debug(&self) -> &DebugState {
        &self.debug
    }

    /// The caller-visible outcome, with the script state cleared.
    pub fn without_debug(&self) -> Self {
        Self {
            debug: DebugState::default(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    pub idempotency_key: String,
    pub account_id: Uuid,
    pub lease_id: Ulid,
    #[serde(default)]
    pub source: LeaseSource,
    #[serde(default)]
    pub migration: MigrationIdentifier,
}

impl ReleaseRequest {
    pub fn new(account_id: Uuid, lease_id: Ulid, idempotency_key: impl Into<String>) -> Self {
        Self {
            idempotency_key: idempotency_key.into(),
            account_id,
            lease_id,
            source: LeaseSource::default(),
            migration: MigrationIdentifier::default(),
        }
    }

    pub fn with_source(mut self, source: LeaseSource) -> Self {
        self.source = source;
        self
    }

    pub fn validate(&self) -> Result<(), UserError> {
        if self.account_id.is_nil() {
            return Err(malformed("missing account id"));
        }
        if self.idempotency_key.is_empty() {
            return Err(malformed("missing idempotency key"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub function_id: Uuid,
    /// Source of the Acquire that created the lease
    pub creation_source: LeaseSource,
    #[serde(skip)]
    pub(crate) debug: DebugState,
}

impl ReleaseResponse {
    pub fn debug(&self) -> &DebugState {
        &self.debug
    }

    /// The caller-visible outcome, with the script state cleared.
    pub fn without_debug(&self) -> Self {
        Self {
            debug: DebugState::default(),
            ..self.clone()
        }
    }
}
