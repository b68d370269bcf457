//! Observers notified after committed lease mutations.
//!
//! Hooks run after the script has committed, in the caller's task, so a single account's
//! events reach each hook in commit order. A failing hook is logged and never fails the
//! operation that triggered it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;
use uuid::Uuid;

use crate::constraint::ConstraintItem;
use crate::request::{Lease, LeaseSource};

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseAcquiredEvent {
    pub shard: String,
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub function_id: Uuid,
    pub request_id: Ulid,
    /// Newly granted leases only
    pub leases: Vec<Lease>,
    pub source: LeaseSource,
    pub constraints: Vec<ConstraintItem>,
    pub limiting_constraints: Vec<ConstraintItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseExtendedEvent {
    pub shard: String,
    pub account_id: Uuid,
    pub previous_lease_id: Ulid,
    pub lease_id: Ulid,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseReleasedEvent {
    pub shard: String,
    pub account_id: Uuid,
    pub env_id: Uuid,
    pub function_id: Uuid,
    pub lease_id: Ulid,
    pub creation_source: LeaseSource,
    pub release_source: LeaseSource,
}

#[async_trait]
pub trait CapacityLifecycle: Send + Sync {
    async fn on_capacity_lease_acquired(&self, _event: &LeaseAcquiredEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_capacity_lease_extended(&self, _event: &LeaseExtendedEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_capacity_lease_released(&self, _event: &LeaseReleasedEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fan-out over a list of hooks.
#[derive(Clone, Default)]
pub struct Lifecycles {
    hooks: Vec<Arc<dyn CapacityLifecycle>>,
}

impl std::fmt::Debug for Lifecycles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycles")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl Lifecycles {
    pub fn new(hooks: Vec<Arc<dyn CapacityLifecycle>>) -> Self {
        Self { hooks }
    }

    pub fn push(&mut self, hook: Arc<dyn CapacityLifecycle>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub(crate) async fn acquired(&self, event: &LeaseAcquiredEvent) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_capacity_lease_acquired(event).await {
                warn!(account_id = %event.account_id, error = %e, "lease acquired hook failed");
            }
        }
    }

    pub(crate) async fn extended(&self, event: &LeaseExtendedEvent) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_capacity_lease_extended(event).await {
                warn!(account_id = %event.account_id, error = %e, "lease extended hook failed");
            }
        }
    }

    pub(crate) async fn released(&self, event: &LeaseReleasedEvent) {
        for hook in &self.hooks {
            if let Err(e) = hook.on_capacity_lease_released(event).await {
                warn!(account_id = %event.account_id, error = %e, "lease released hook failed");
            }
        }
    }
}

/// Emits a debug event per lease mutation.
#[derive(Debug, Default)]
pub struct TracingLifecycle;

#[async_trait]
impl CapacityLifecycle for TracingLifecycle {
    async fn on_capacity_lease_acquired(&self, event: &LeaseAcquiredEvent) -> anyhow::Result<()> {
        debug!(
            shard = %event.shard,
            account_id = %event.account_id,
            function_id = %event.function_id,
            request_id = %event.request_id,
            leases = event.leases.len(),
            service = %event.source.service,
            location = %event.source.location,
            "capacity lease acquired"
        );
        Ok(())
    }

    async fn on_capacity_lease_extended(&self, event: &LeaseExtendedEvent) -> anyhow::Result<()> {
        debug!(
            shard = %event.shard,
            account_id = %event.account_id,
            previous_lease_id = %event.previous_lease_id,
            lease_id = %event.lease_id,
            "capacity lease extended"
        );
        Ok(())
    }

    async fn on_capacity_lease_released(&self, event: &LeaseReleasedEvent) -> anyhow::Result<()> {
        debug!(
            shard = %event.shard,
            account_id = %event.account_id,
            lease_id = %event.lease_id,
            service = %event.release_source.service,
            "capacity lease released"
        );
        Ok(())
    }
}

/// Keeps every event in memory. Useful for debugging and assertions.
#[derive(Debug, Default)]
pub struct RecordingLifecycle {
    acquired: Mutex<Vec<LeaseAcquiredEvent>>,
    extended: Mutex<Vec<LeaseExtendedEvent>>,
    released: Mutex<Vec<LeaseReleasedEvent>>,
}

impl RecordingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> Vec<LeaseAcquiredEvent> {
        self.acquired.lock().clone()
    }

    pub fn extended(&self) -> Vec<LeaseExtendedEvent> {
        self.extended.lock().clone()
    }

    pub fn released(&self) -> Vec<LeaseReleasedEvent> {
        self.released.lock().clone()
    }
}

#[async_trait]
impl CapacityLifecycle for RecordingLifecycle {
    async fn on_capacity_lease_acquired(&self, event: &LeaseAcquiredEvent) -> anyhow::Result<()> {
        self.acquired.lock().push(event.clone());
        Ok(())
    }

    async fn on_capacity_lease_extended(&self, event: &LeaseExtendedEvent) -> anyhow::Result<()> {
        self.extended.lock().push(event.clone());
        Ok(())
    }

    async fn on_capacity_lease_released(&self, event: &LeaseReleasedEvent) -> anyhow::Result<()> {
        self.released.lock().push(event.clone());
        Ok(())
    }
}
