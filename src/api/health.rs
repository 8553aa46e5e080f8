//! Shared health state for the /health endpoint.
//! Updated by BusListener and the sync coordinator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Shared health metrics. Sync components record, API reads.
#[derive(Default)]
pub struct HealthState {
    /// True while the change-notification connection is up.
    pub bus_connected: AtomicBool,
    /// Millisecond timestamp of the last applied markets sync (0 = none).
    pub last_sync_at_ms: AtomicU64,
    /// Count of successfully applied syncs across all domains.
    pub syncs_completed: AtomicU64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bus_connected(&self, v: bool) {
        self.bus_connected.store(v, Ordering::Relaxed);
    }

    pub fn bus_connected(&self) -> bool {
        self.bus_connected.load(Ordering::Relaxed)
    }

    pub fn set_last_sync_at_ms(&self, ms: u64) {
        self.last_sync_at_ms.store(ms, Ordering::Relaxed);
    }

    pub fn last_sync_at_ms(&self) -> u64 {
        self.last_sync_at_ms.load(Ordering::Relaxed)
    }

    pub fn inc_syncs_completed(&self) {
        self.syncs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn syncs_completed(&self) -> u64 {
        self.syncs_completed.load(Ordering::Relaxed)
    }
}
