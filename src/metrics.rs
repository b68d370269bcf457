//! Prometheus metrics for the capacity manager.
//!
//! Initialize once and hand clones to every component:
//! ```ignore
//! let metrics = leasekeeper::metrics::init()?;
//! config.metrics = Some(metrics.clone());
//! ```
//!
//! Exposition is left to the embedding service; [`Metrics::encode_text`] renders the
//! registry in the text format.

use std::sync::Arc;

use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

/// Default histogram buckets for script latencies (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Buckets for migration phases (in seconds)
const MIGRATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0];

/// Metrics handle containing all metric instruments.
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    script_duration: HistogramVec,
    operations: CounterVec,
    acquire_outcomes: CounterVec,
    leases: CounterVec,
    account_leases: CounterVec,

    scavenger_reclaimed: CounterVec,
    scavenger_expired_accounts: IntGaugeVec,

    cache_hits: CounterVec,

    migrations: CounterVec,
    migration_phase_duration: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode_text(&self) -> anyhow::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }

    /// Record one script round-trip.
    pub fn record_script(&self, shard: &str, operation: &str, status: &str, duration_secs: f64) {
        self.script_duration
            .with_label_values(&[shard, operation])
            .observe(duration_secs);
        self.operations
            .with_label_values(&[shard, operation, status])
            .inc();
    }

    /// Record the outcome of an Acquire: `granted`, `lacking_capacity`, `replay` or
    /// `cached`.
    pub fn record_acquire_outcome(&self, shard: &str, outcome: &str) {
        self.acquire_outcomes
            .with_label_values(&[shard, outcome])
            .inc();
    }

    /// Record lease state changes. `event` is `acquired`, `extended` or `released`.
    pub fn record_leases(&self, shard: &str, event: &str, count: u64) {
        self.leases
            .with_label_values(&[shard, event])
            .inc_by(count as f64);
    }

    /// Per-account lease counter; only called when high-cardinality metrics are enabled.
    pub fn record_account_leases(&self, shard: &str, account: &str, event: &str, count: u64) {
        self.account_leases
            .with_label_values(&[shard, account, event])
            .inc_by(count as f64);
    }

    pub fn record_scavenge(&self, shard: &str, reclaimed: u64, expired_accounts: i64) {
        self.scavenger_reclaimed
            .with_label_values(&[shard])
            .inc_by(reclaimed as f64);
        self.scavenger_expired_accounts
            .with_label_values(&[shard])
            .set(expired_accounts);
    }

    /// `cache` is `limiting_constraint` or `acquire_response`.
    pub fn record_cache_hit(&self, cache: &str) {
        self.cache_hits.with_label_values(&[cache]).inc();
    }

    pub fn record_migration(&self, outcome: &str) {
        self.migrations.with_label_values(&[outcome]).inc();
    }

    pub fn record_migration_phase(&self, phase: &str, duration_secs: f64) {
        self.migration_phase_duration
            .with_label_values(&[phase])
            .observe(duration_secs);
    }
}

/// Helper to register a metric, logging on failure.
fn register<C: Collector + Clone + 'static>(registry: &Registry, metric: C) -> C {
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        // Log but don't fail - metric may already be registered
        tracing::warn!(error = %e, "failed to register metric");
    }
    metric
}

/// Initialize the metrics system with a fresh Prometheus registry.
pub fn init() -> anyhow::Result<Metrics> {
    let registry = Registry::new();

    let script_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "leasekeeper_script_duration_seconds",
                "Duration of capacity scripts including the store round-trip",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["shard", "operation"],
        )?,
    );

    let operations = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "leasekeeper_operations_total",
                "Capacity operations by outcome status",
            ),
            &["shard", "operation", "status"],
        )?,
    );

    let acquire_outcomes = register(
        &registry,
        CounterVec::new(
            Opts::new("leasekeeper_acquire_outcomes_total", "Acquire outcomes"),
            &["shard", "outcome"],
        )?,
    );

    let leases = register(
        &registry,
        CounterVec::new(
            Opts::new("leasekeeper_leases_total", "Lease state changes"),
            &["shard", "event"],
        )?,
    );

    let account_leases = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "leasekeeper_account_leases_total",
                "Lease state changes per account",
            ),
            &["shard", "account", "event"],
        )?,
    );

    let scavenger_reclaimed = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "leasekeeper_scavenger_reclaimed_leases_total",
                "Expired leases released by the scavenger",
            ),
            &["shard"],
        )?,
    );

    let scavenger_expired_accounts = register(
        &registry,
        IntGaugeVec::new(
            Opts::new(
                "leasekeeper_scavenger_expired_accounts",
                "Accounts with expired leases seen by the last scavenge",
            ),
            &["shard"],
        )?,
    );

    let cache_hits = register(
        &registry,
        CounterVec::new(
            Opts::new("leasekeeper_cache_hits_total", "Capacity cache hits"),
            &["cache"],
        )?,
    );

    let migrations = register(
        &registry,
        CounterVec::new(
            Opts::new(
                "leasekeeper_migrations_total",
                "Account migrations by outcome",
            ),
            &["outcome"],
        )?,
    );

    let migration_phase_duration = register(
        &registry,
        HistogramVec::new(
            HistogramOpts::new(
                "leasekeeper_migration_phase_duration_seconds",
                "Time spent in each migration phase",
            )
            .buckets(MIGRATION_BUCKETS.to_vec()),
            &["phase"],
        )?,
    );

    Ok(Metrics {
        registry: Arc::new(registry),
        script_duration,
        operations,
        acquire_outcomes,
        leases,
        account_leases,
        scavenger_reclaimed,
        scavenger_expired_accounts,
        cache_hits,
        migrations,
        migration_phase_duration,
    })
}
