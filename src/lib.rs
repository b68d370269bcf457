//! Sharded capacity and lease manager.
//!
//! Callers acquire time-bounded leases against concurrency, rate-limit and throttle
//! constraints, extend and release them, and rely on a scavenger to reclaim leases that
//! expire. Accounts can be migrated between store shards while they are in use.

pub mod cache;
pub mod capacity;
pub mod clock;
pub mod constraint;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod metrics;
pub mod migration;
pub mod request;
pub mod routing;
pub mod scavenger;
pub mod settings;
pub mod store;
pub mod trace;

pub use leasekeeper_macros::test;
