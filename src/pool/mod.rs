//! Container Pool
//!
//! In-memory view of which model containers are running. The pool is the only
//! component that starts or stops containers at request time. It keeps the
//! number of live containers under `max_running` by evicting the least
//! recently used one before a cold start.

mod manager;

#[cfg(test)]
mod tests;

pub use manager::PoolManager;

use crate::registry::ModelId;
use crate::runtime::UnitRef;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on simultaneously running containers.
    pub max_running: usize,

    /// Bound on a single engine start call.
    pub start_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_running: 10,
            start_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of [`PoolManager::ensure_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub external_port: u16,

    /// The container was started by this call and may still be booting.
    pub cold_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Made room for another model.
    Evicted,
    /// Idle past the reaper threshold.
    Idle,
    Requested,
    Shutdown,
    /// The engine no longer reports the container running.
    Vanished,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Evicted => "evicted",
            StopReason::Idle => "idle",
            StopReason::Requested => "requested",
            StopReason::Shutdown => "shutdown",
            StopReason::Vanished => "vanished",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub enum PoolEvent {
    Started {
        model_id: ModelId,
        unit: UnitRef,
        external_port: u16,
    },

    Stopped {
        model_id: ModelId,
        unit: UnitRef,
        reason: StopReason,
    },

    StartFailed {
        model_id: ModelId,
        unit: UnitRef,
        error: String,
    },
}

pub type EventCallback = Box<dyn Fn(&PoolEvent) + Send + Sync>;

/// One running container as seen at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolEntryView {
    pub unit: UnitRef,
    pub model_id: ModelId,
    pub external_port: u16,
    pub last_used: Instant,
    pub last_used_at: DateTime<Utc>,
    pub seq: u64,
}

/// Consistent view of the pool at a single instant; entries in start order.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub running_count: usize,
    pub max_running: usize,
    pub entries: Vec<PoolEntryView>,
}

impl PoolSnapshot {
    pub fn get(&self, model_id: ModelId) -> Option<&PoolEntryView> {
        self.entries.iter().find(|e| e.model_id == model_id)
    }
}
