//! In-process caches that short-circuit Acquire denials.
//!
//! Both caches only ever replay a lack of capacity; a grant always comes from the store.
//! - [`LimitingConstraintCache`]: wraps any [`crate::capacity::CapacityManager`] and
//!   remembers constraints that recently limited an Acquire until their retry time.
//! - [`AcquireResponseCache`]: lives inside the shard manager and replays a whole denial
//!   for a very short TTL to collapse bursts of identical requests.

mod acquire;
mod limiting;

pub use acquire::AcquireResponseCache;
pub use limiting::{LimitingCacheOptions, LimitingConstraintCache};
