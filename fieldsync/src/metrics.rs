//! Per-cycle observability records
//!
//! Nothing here is durable; the recorder keeps a bounded window of recent
//! local-DB save cycles for diagnostics and emits one tracing event per cycle.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 100;

/// Whole milliseconds, saturating at `u64::MAX`
pub(crate) fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Outcome of one reconcile-and-write cycle for an entity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMetrics {
    pub correlation_id: Uuid,
    pub entity: String,
    pub total_items: usize,
    pub safe_data_items: usize,
    /// Items dropped because a local mutation on the same id is pending
    pub skipped_items: usize,
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub chunk_durations: Vec<Duration>,
    pub total_duration: Duration,
    pub used_chunk_processing: bool,
    pub estimated_memory_bytes: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Process-lifetime counters of the fast push service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FastPushMetrics {
    pub mutations_coalesced: u64,
    /// Successful pushes only
    pub push_count: u64,
    pub push_failures: u64,
    pub pushes_skipped_offline: u64,
    pub full_syncs_throttled: u64,
    pub full_syncs_run: u64,
    pub full_syncs_deferred: u64,
    pub last_push_at: Option<DateTime<Utc>>,
    pub scheduled_full_sync_pending: bool,
}

/// Counters of the push-notification trigger router
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMetrics {
    pub received: u64,
    /// Payloads superseded by a later one for the same key
    pub coalesced: u64,
    pub executed: u64,
    pub blocked: u64,
    pub failed: u64,
}

/// Bounded window of recent save cycles
#[derive(Debug)]
pub struct SyncMetrics {
    recent: Mutex<VecDeque<SaveMetrics>>,
    capacity: usize,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    pub fn record_save_to_local_db(&self, metrics: SaveMetrics) {
        tracing::info!(
            correlation_id = %metrics.correlation_id,
            entity = %metrics.entity,
            total_items = metrics.total_items,
            safe_data_items = metrics.safe_data_items,
            skipped_items = metrics.skipped_items,
            chunk_count = metrics.chunk_count,
            used_chunk_processing = metrics.used_chunk_processing,
            duration_ms = whole_millis(metrics.total_duration),
            estimated_memory_bytes = metrics.estimated_memory_bytes,
            "Saved snapshot to local db"
        );

        let mut recent = self.recent.lock();
        while recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(metrics);
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<SaveMetrics> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn last_for(&self, entity: &str) -> Option<SaveMetrics> {
        self.recent
            .lock()
            .iter()
            .rev()
            .find(|m| m.entity == entity)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.recent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recent.lock().is_empty()
    }

    pub fn clear(&self) {
        self.recent.lock().clear();
    }
}
