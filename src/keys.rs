use uuid::Uuid;
use xxhash_rust::xxh64::xxh64;

use crate::constraint::Scope;

/// Default hash-tag prefix. Every key rendered by [`KeyGenerator`] starts with `{<prefix>}`
/// so all keys colocate on a single slot.
pub const DEFAULT_KEY_PREFIX: &str = "cs";

/// Hex-encoded xxh64 of an arbitrary caller-provided key.
pub fn hash_key(raw: &str) -> String {
    format!("{:016x}", xxh64(raw.as_bytes(), 0))
}

/// Renders every persisted key for one store shard.
///
/// Rate-limit and throttle cells live under their own prefix, which defaults to the
/// lease-state prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyGenerator {
    prefix: String,
    rate_limit_prefix: String,
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            rate_limit_prefix: prefix.clone(),
            prefix,
        }
    }

    pub fn with_rate_limit_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.rate_limit_prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn rate_limit_prefix(&self) -> &str {
        &self.rate_limit_prefix
    }

    /// The global scavenger shard: ZSET accountID -> earliest lease expiry (ms)
    pub fn scavenger_shard(&self) -> String {
        format!("{{{}}}:css", self.prefix)
    }

    /// Prefix shared by every key of one account, including the trailing colon
    pub fn account_prefix(&self, account_id: Uuid) -> String {
        format!("{{{}}}:a:{}:", self.prefix, account_id)
    }

    /// Scan pattern matching every lease-state key of one account
    pub fn account_pattern(&self, account_id: Uuid) -> String {
        format!("{}*", self.account_prefix(account_id))
    }

    /// Prefix of one account's rate-limit and throttle cells
    pub fn rate_limit_account_prefix(&self, account_id: Uuid) -> String {
        format!("{{{}}}:a:{}:", self.rate_limit_prefix, account_id)
    }

    /// Every pattern an account migration has to scan. A distinct rate-limit prefix adds
    /// a second pattern.
    pub fn account_patterns(&self, account_id: Uuid) -> Vec<String> {
        let mut patterns = vec![self.account_pattern(account_id)];
        if self.rate_limit_prefix != self.prefix {
            patterns.push(format!("{}*", self.rate_limit_account_prefix(account_id)));
        }
        patterns
    }

    /// Lease index: ZSET leaseID -> expiry (ms)
    pub fn account_leases(&self, account_id: Uuid) -> String {
        format!("{}leaseq", self.account_prefix(account_id))
    }

    /// Lease details hash
    pub fn lease_details(&self, account_id: Uuid, lease_id: &str) -> String {
        format!("{}ld:{}", self.account_prefix(account_id), lease_id)
    }

    /// JSON request state written by Acquire
    pub fn request_state(&self, account_id: Uuid, request_id: &str) -> String {
        format!("{}rs:{}", self.account_prefix(account_id), request_id)
    }

    /// Operation idempotency record. `operation` is one of `acq`, `chk`, `ext`, `rel`.
    pub fn operation_idempotency(
        &self,
        account_id: Uuid,
        operation: &str,
        idempotency_key: &str,
    ) -> String {
        format!(
            "{}ik:op:{}:{}",
            self.account_prefix(account_id),
            operation,
            hash_key(idempotency_key)
        )
    }

    /// Constraint-check idempotency record for one lease idempotency key
    pub fn constraint_check_idempotency(&self, account_id: Uuid, lease_key: &str) -> String {
        format!(
            "{}ik:cc:{}",
            self.account_prefix(account_id),
            hash_key(lease_key)
        )
    }

    /// In-progress leases counting against account concurrency
    pub fn in_progress_account(&self, account_id: Uuid) -> String {
        format!(
            "{}concurrency:account:{}",
            self.account_prefix(account_id),
            account_id
        )
    }

    /// In-progress leases counting against function concurrency
    pub fn in_progress_function(&self, account_id: Uuid, function_id: Uuid) -> String {
        format!(
            "{}concurrency:p:{}",
            self.account_prefix(account_id),
            function_id
        )
    }

    /// In-progress leases counting against account run concurrency
    pub fn in_progress_account_runs(&self, account_id: Uuid) -> String {
        format!(
            "{}concurrency:run:account:{}",
            self.account_prefix(account_id),
            account_id
        )
    }

    /// In-progress leases counting against function run concurrency
    pub fn in_progress_function_runs(&self, account_id: Uuid, function_id: Uuid) -> String {
        format!(
            "{}concurrency:run:p:{}",
            self.account_prefix(account_id),
            function_id
        )
    }

    /// In-progress leases for a custom concurrency key. `entity_id` is the account,
    /// environment or function the key is scoped to.
    pub fn in_progress_custom(
        &self,
        account_id: Uuid,
        scope: Scope,
        entity_id: Uuid,
        key_expression_hash: &str,
        evaluated_key_hash: &str,
    ) -> String {
        format!(
            "{}concurrency:custom:{}:{}:{}:{}",
            self.account_prefix(account_id),
            scope.short_name(),
            entity_id,
            key_expression_hash,
            evaluated_key_hash
        )
    }

    /// GCRA cell for a rate limit. `entity_id` is the account, environment or function
    /// the scope resolves to.
    pub fn rate_limit(
        &self,
        account_id: Uuid,
        scope: Scope,
        entity_id: Uuid,
        key_expression_hash: &str,
        evaluated_key_hash: &str,
    ) -> String {
        self.gcra_cell(
            "rl",
            account_id,
            scope,
            entity_id,
            key_expression_hash,
            evaluated_key_hash,
        )
    }

    /// GCRA cell for a throttle
    pub fn throttle(
        &self,
        account_id: Uuid,
        scope: Scope,
        entity_id: Uuid,
        key_expression_hash: &str,
        evaluated_key_hash: &str,
    ) -> String {
        self.gcra_cell(
            "th",
            account_id,
            scope,
            entity_id,
            key_expression_hash,
            evaluated_key_hash,
        )
    }

    fn gcra_cell(
        &self,
        kind: &str,
        account_id: Uuid,
        scope: Scope,
        entity_id: Uuid,
        key_expression_hash: &str,
        evaluated_key_hash: &str,
    ) -> String {
        format!(
            "{}{}:{}:{}:{}",
            self.rate_limit_account_prefix(account_id),
            kind,
            scope.short_name(),
            entity_id,
            hash_key(&format!("{}:{}", key_expression_hash, evaluated_key_hash))
        )
    }

    /// Extract the account id from any account-scoped key rendered by this generator.
    pub fn parse_account(&self, key: &str) -> Option<Uuid> {
        let rest = key
            .strip_prefix(&format!("{{{}}}:a:", self.prefix))
            .or_else(|| key.strip_prefix(&format!("{{{}}}:a:", self.rate_limit_prefix)))?;
        let (id, _) = rest.split_once(':')?;
        Uuid::parse_str(id).ok()
    }
}
