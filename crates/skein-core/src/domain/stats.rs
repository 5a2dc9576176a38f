//! Point-in-time read models. Recomputed on every call, never cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Counts per job status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    /// Jobs currently held in the dead-letter list.
    pub dead_lettered: u64,
    pub paused: bool,
}

impl QueueStats {
    /// Jobs that still need work (waiting + delayed + active).
    pub fn outstanding(&self) -> u64 {
        self.waiting + self.delayed + self.active
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }

    pub fn total(&self) -> u64 {
        self.outstanding() + self.completed + self.failed
    }
}

/// Health snapshot of a queue and its adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub healthy: bool,
    pub connected: bool,
    pub paused: bool,
    /// Terminal failures over finalized jobs, in `[0, 1]`.
    pub error_rate: f64,
    pub active_workers: usize,
    pub waiting: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    /// Error rate from finalized counters; zero when nothing finished yet.
    pub fn error_rate_of(completed: u64, failed: u64) -> f64 {
        let total = completed + failed;
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }
}
