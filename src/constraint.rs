//! Constraint model: the live constraint items a request is evaluated against, the
//! per-function configuration they resolve limits from, and the compact serialized form
//! scripts and request state use.
//!
//! Items are evaluated in a stable order: `(kind code, scope, key expression hash,
//! evaluated key hash, mode)`. Kind codes are part of the persisted request state and must
//! not change: 1 = rate limit, 2 = concurrency, 3 = throttle.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UserError;
use crate::keys::KeyGenerator;

/// How long a caller should wait after hitting a concurrency limit when no lease frees up
/// sooner.
pub const DEFAULT_CONCURRENCY_RETRY_AFTER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    RateLimit,
    Concurrency,
    Throttle,
}

impl ConstraintKind {
    pub fn code(self) -> u8 {
        match self {
            ConstraintKind::RateLimit => 1,
            ConstraintKind::Concurrency => 2,
            ConstraintKind::Throttle => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConstraintKind::RateLimit),
            2 => Some(ConstraintKind::Concurrency),
            3 => Some(ConstraintKind::Throttle),
            _ => None,
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstraintKind::RateLimit => "rate_limit",
            ConstraintKind::Concurrency => "concurrency",
            ConstraintKind::Throttle => "throttle",
        };
        write!(f, "{}", s)
    }
}

/// Entity a constraint is scoped to. Integer codes are persisted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Fn,
    Env,
    Account,
}

impl Scope {
    pub fn code(self) -> u8 {
        match self {
            Scope::Fn => 0,
            Scope::Env => 1,
            Scope::Account => 2,
        }
    }

    pub fn short_name(self) -> &'static str {
        match self {
            Scope::Fn => "f",
            Scope::Env => "e",
            Scope::Account => "a",
        }
    }

    fn entity(self, account_id: Uuid, env_id: Uuid, function_id: Uuid) -> Uuid {
        match self {
            Scope::Fn => function_id,
            Scope::Env => env_id,
            Scope::Account => account_id,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Scope::Fn => "fn",
            Scope::Env => "env",
            Scope::Account => "account",
        };
        write!(f, "{}", s)
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    #[default]
    Step,
    Run,
}

impl ConcurrencyMode {
    pub fn code(self) -> u8 {
        match self {
            ConcurrencyMode::Step => 0,
            ConcurrencyMode::Run => 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencyConstraint {
    #[serde(default)]
    pub mode: ConcurrencyMode,
    #[serde(default)]
    pub scope: Scope,
    /// Identity of the compiled custom key; empty for the built-in account/function limits
    #[serde(default)]
    pub key_expression_hash: String,
    #[serde(default)]
    pub evaluated_key_hash: String,
}

impl ConcurrencyConstraint {
    pub fn is_custom_key(&self) -> bool {
        !self.key_expression_hash.is_empty()
    }

    pub fn in_progress_key(
        &self,
        keys: &KeyGenerator,
        account_id: Uuid,
        env_id: Uuid,
        function_id: Uuid,
    ) -> String {
        if self.is_custom_key() {
            return keys.in_progress_custom(
                account_id,
                self.scope,
                self.scope.entity(account_id, env_id, function_id),
                &self.key_expression_hash,
                &self.evaluated_key_hash,
            );
        }
        match (self.scope, self.mode) {
            (Scope::Account, ConcurrencyMode::Step) => keys.in_progress_account(account_id),
            (Scope::Account, ConcurrencyMode::Run) => keys.in_progress_account_runs(account_id),
            (_, ConcurrencyMode::Step) => keys.in_progress_function(account_id, function_id),
            (_, ConcurrencyMode::Run) => keys.in_progress_function_runs(account_id, function_id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitConstraint {
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub key_expression_hash: String,
    #[serde(default)]
    pub evaluated_key_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThrottleConstraint {
    #[serde(default)]
    pub scope: Scope,
    #[serde(default)]
    pub key_expression_hash: String,
    #[serde(default)]
    pub evaluated_key_hash: String,
}

/// One live constraint instance, tagged by kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintItem {
    RateLimit(RateLimitConstraint),
    Concurrency(ConcurrencyConstraint),
    Throttle(ThrottleConstraint),
}

impl ConstraintItem {
    pub fn account_concurrency() -> Self {
        ConstraintItem::Concurrency(ConcurrencyConstraint {
            scope: Scope::Account,
            ..Default::default()
        })
    }

    pub fn function_concurrency() -> Self {
        ConstraintItem::Concurrency(ConcurrencyConstraint {
            scope: Scope::Fn,
            ..Default::default()
        })
    }

    pub fn kind(&self) -> ConstraintKind {
        match self {
            ConstraintItem::RateLimit(_) => ConstraintKind::RateLimit,
            ConstraintItem::Concurrency(_) => ConstraintKind::Concurrency,
            ConstraintItem::Throttle(_) => ConstraintKind::Throttle,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            ConstraintItem::RateLimit(c) => c.scope,
            ConstraintItem::Concurrency(c) => c.scope,
            ConstraintItem::Throttle(c) => c.scope,
        }
    }

    pub fn key_expression_hash(&self) -> &str {
        match self {
            ConstraintItem::RateLimit(c) => &c.key_expression_hash,
            ConstraintItem::Concurrency(c) => &c.key_expression_hash,
            ConstraintItem::Throttle(c) => &c.key_expression_hash,
        }
    }

    pub fn evaluated_key_hash(&self) -> &str {
        match self {
            ConstraintItem::RateLimit(c) => &c.evaluated_key_hash,
            ConstraintItem::Concurrency(c) => &c.evaluated_key_hash,
            ConstraintItem::Throttle(c) => &c.evaluated_key_hash,
        }
    }

    fn mode_code(&self) -> u8 {
        match self {
            ConstraintItem::Concurrency(c) => c.mode.code(),
            _ => 0,
        }
    }

    fn sort_key(&self) -> (u8, u8, &str, &str, u8) {
        (
            self.kind().code(),
            self.scope().code(),
            self.key_expression_hash(),
            self.evaluated_key_hash(),
            self.mode_code(),
        )
    }

    /// Identity of this constraint instance within an account, including the entity the
    /// scope resolves to.
    pub fn cache_key(&self, account_id: Uuid, env_id: Uuid, function_id: Uuid) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}:{}",
            account_id,
            self.kind().code(),
            self.scope().code(),
            self.scope().entity(account_id, env_id, function_id),
            self.mode_code(),
            self.key_expression_hash(),
            self.evaluated_key_hash()
        )
    }

    /// Resolve the configured limits for this item and render its state keys.
    pub fn serialize(
        &self,
        config: &ConstraintConfig,
        keys: &KeyGenerator,
        account_id: Uuid,
        env_id: Uuid,
        function_id: Uuid,
    ) -> Result<SerializedConstraintItem, UserError> {
        let mut out = SerializedConstraintItem {
            kind: self.kind().code(),
            ..Default::default()
        };
        match self {
            ConstraintItem::Concurrency(c) => {
                let limit = if c.is_custom_key() {
                    config
                        .concurrency
                        .custom_concurrency_keys
                        .iter()
                        .find(|k| {
                            k.mode == c.mode
                                && k.scope == c.scope
                                && k.key_expression_hash == c.key_expression_hash
                        })
                        .map(|k| k.limit)
                        .ok_or_else(|| {
                            UserError::UnknownConstraint(format!(
                                "no custom concurrency key {} configured",
                                c.key_expression_hash
                            ))
                        })?
                } else {
                    match (c.scope, c.mode) {
                        (Scope::Account, ConcurrencyMode::Step) => {
                            config.concurrency.account_concurrency
                        }
                        (Scope::Account, ConcurrencyMode::Run) => {
                            config.concurrency.account_run_concurrency
                        }
                        (Scope::Fn, ConcurrencyMode::Step) => {
                            config.concurrency.function_concurrency
                        }
                        (Scope::Fn, ConcurrencyMode::Run) => {
                            config.concurrency.function_run_concurrency
                        }
                        (Scope::Env, _) => {
                            return Err(UserError::UnknownConstraint(
                                "environment concurrency requires a custom key".to_string(),
                            ))
                        }
                    }
                };
                out.concurrency = Some(SerializedConcurrency {
                    mode: c.mode.code(),
                    scope: c.scope.code(),
                    key_expression_hash: c.key_expression_hash.clone(),
                    evaluated_key_hash: c.evaluated_key_hash.clone(),
                    limit,
                    in_progress_key: c.in_progress_key(keys, account_id, env_id, function_id),
                    retry_after_ms: DEFAULT_CONCURRENCY_RETRY_AFTER.as_millis() as i64,
                });
            }
            ConstraintItem::RateLimit(c) => {
                let cfg = config
                    .rate_limit
                    .iter()
                    .find(|r| r.scope == c.scope && r.key_expression_hash == c.key_expression_hash)
                    .ok_or_else(|| {
                        UserError::UnknownConstraint(format!(
                            "no rate limit configured for scope {} key {:?}",
                            c.scope, c.key_expression_hash
                        ))
                    })?;
                out.rate_limit = Some(SerializedRateLimit {
                    scope: c.scope.code(),
                    key_expression_hash: c.key_expression_hash.clone(),
                    evaluated_key_hash: c.evaluated_key_hash.clone(),
                    limit: cfg.limit,
                    period_ms: cfg.period_secs.saturating_mul(1_000),
                    key: keys.rate_limit(
                        account_id,
                        c.scope,
                        c.scope.entity(account_id, env_id, function_id),
                        &c.key_expression_hash,
                        &c.evaluated_key_hash,
                    ),
                });
            }
            ConstraintItem::Throttle(c) => {
                let cfg = config
                    .throttle
                    .iter()
                    .find(|t| t.scope == c.scope && t.key_expression_hash == c.key_expression_hash)
                    .ok_or_else(|| {
                        UserError::UnknownConstraint(format!(
                            "no throttle configured for scope {} key {:?}",
                            c.scope, c.key_expression_hash
                        ))
                    })?;
                out.throttle = Some(SerializedThrottle {
                    scope: c.scope.code(),
                    key_expression_hash: c.key_expression_hash.clone(),
                    evaluated_key_hash: c.evaluated_key_hash.clone(),
                    limit: cfg.limit,
                    burst: cfg.burst,
                    period_ms: cfg.period_secs.saturating_mul(1_000),
                    key: keys.throttle(
                        account_id,
                        c.scope,
                        c.scope.entity(account_id, env_id, function_id),
                        &c.key_expression_hash,
                        &c.evaluated_key_hash,
                    ),
                });
            }
        }
        Ok(out)
    }
}

/// Sort constraints into evaluation order.
pub fn sort_constraints(items: &mut [ConstraintItem]) {
    items.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomConcurrencyLimit {
    pub mode: ConcurrencyMode,
    pub scope: Scope,
    pub key_expression_hash: String,
    pub limit: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default)]
    pub account_concurrency: i64,
    #[serde(default)]
    pub function_concurrency: i64,
    #[serde(default)]
    pub account_run_concurrency: i64,
    #[serde(default)]
    pub function_run_concurrency: i64,
    #[serde(default)]
    pub custom_concurrency_keys: Vec<CustomConcurrencyLimit>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub scope: Scope,
    pub limit: i64,
    pub period_secs: i64,
    #[serde(default)]
    pub key_expression_hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    pub scope: Scope,
    pub limit: i64,
    pub burst: i64,
    pub period_secs: i64,
    #[serde(default)]
    pub key_expression_hash: String,
}

/// Per-function limits. A limit <= 0 means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintConfig {
    #[serde(default)]
    pub function_version: i64,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub rate_limit: Vec<RateLimitConfig>,
    #[serde(default)]
    pub throttle: Vec<ThrottleConfig>,
}

/// Compact form embedded in request state and evaluated by scripts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedConstraintItem {
    #[serde(rename = "k", default)]
    pub kind: u8,
    #[serde(rename = "c", default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<SerializedConcurrency>,
    #[serde(rename = "r", default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<SerializedRateLimit>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<SerializedThrottle>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedConcurrency {
    #[serde(rename = "m", default)]
    pub mode: u8,
    #[serde(rename = "s", default)]
    pub scope: u8,
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    #[serde(rename = "eh", default, skip_serializing_if = "String::is_empty")]
    pub evaluated_key_hash: String,
    #[serde(rename = "l", default)]
    pub limit: i64,
    #[serde(rename = "ilk", default)]
    pub in_progress_key: String,
    #[serde(rename = "ra", default)]
    pub retry_after_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedRateLimit {
    #[serde(rename = "s", default)]
    pub scope: u8,
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    #[serde(rename = "eh", default, skip_serializing_if = "String::is_empty")]
    pub evaluated_key_hash: String,
    #[serde(rename = "l", default)]
    pub limit: i64,
    #[serde(rename = "p", default)]
    pub period_ms: i64,
    #[serde(rename = "k", default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SerializedThrottle {
    #[serde(rename = "s", default)]
    pub scope: u8,
    #[serde(rename = "h", default, skip_serializing_if = "String::is_empty")]
    pub key_expression_hash: String,
    #[serde(rename = "eh", default, skip_serializing_if = "String::is_empty")]
    pub evaluated_key_hash: String,
    #[serde(rename = "l", default)]
    pub limit: i64,
    #[serde(rename = "b", default)]
    pub burst: i64,
    #[serde(rename = "p", default)]
    pub period_ms: i64,
    #[serde(rename = "k", default)]
    pub key: String,
}

/// Concurrency in-progress keys named by a serialized request state document.
///
/// Items of unknown kind and fields this version does not know about are ignored.
pub fn concurrency_keys_from_request_state(raw: &str) -> Result<Vec<String>, serde_json::Error> {
    #[derive(Deserialize)]
    struct Partial {
        #[serde(rename = "s", default)]
        constraints: Vec<serde_json::Value>,
    }

    let state: Partial = serde_json::from_str(raw)?;
    let keys = state
        .constraints
        .into_iter()
        .filter_map(|item| serde_json::from_value::<SerializedConstraintItem>(item).ok())
        .filter(|item| item.kind == ConstraintKind::Concurrency.code())
        .filter_map(|item| item.concurrency)
        .map(|c| c.in_progress_key)
        .filter(|k| !k.is_empty())
        .collect();
    Ok(keys)
}
