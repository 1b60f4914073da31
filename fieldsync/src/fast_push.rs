//! Debounced push of local mutations, with throttled follow-up full syncs
//!
//! Mutation notifications restart a short debounce timer; the push fires
//! after a quiet period or as soon as the buffer fills. Only one push cycle
//! runs at a time; requests that arrive while one is in flight are merged
//! into a single follow-up cycle run by the current owner.
//!
//! A successful push schedules a full sync, throttled against the last
//! full-sync completion. Timers use the tokio clock.

use crate::config::{SharedSettings, SyncSettings};
use crate::connectivity::Connectivity;
use crate::error::SyncResult;
use crate::metrics::{whole_millis, FastPushMetrics};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Summary of one drained push batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushReport {
    /// Mutations the server accepted
    pub pushed: usize,
    /// Mutations the server rejected
    pub failed: usize,
}

/// Sends queued mutations to the server
#[async_trait]
pub trait PushExecutor: Send + Sync {
    async fn push(&self) -> SyncResult<PushReport>;
}

/// Pulls and reconciles every registered entity
#[async_trait]
pub trait FullSyncRunner: Send + Sync {
    async fn run_full_sync(&self) -> SyncResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Pushed(PushReport),
    SkippedOffline,
    /// Another cycle is in flight and will run a follow-up
    Deferred,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullSyncSchedule {
    Scheduled,
    AlreadyScheduled,
    Throttled { remaining: Duration },
}

/// Time left before another full sync may run; zero when allowed
pub fn throttle_remaining_at(last_completed: Option<Instant>, throttle: Duration, now: Instant) -> Duration {
    match last_completed {
        Some(last) => (last + throttle).saturating_duration_since(now),
        None => Duration::ZERO,
    }
}

#[derive(Default)]
struct PushState {
    buffered: usize,
    debounce: Option<JoinHandle<()>>,
    debounce_generation: u64,
    scheduled_full_sync: Option<JoinHandle<()>>,
    last_full_sync_at: Option<Instant>,
    rerun_requested: bool,
    metrics: FastPushMetrics,
}

impl PushState {
    fn cancel_debounce(&mut self) {
        self.debounce_generation += 1;
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
    }
}

struct Inner {
    settings: SharedSettings,
    pusher: Arc<dyn PushExecutor>,
    full_sync: Arc<dyn FullSyncRunner>,
    connectivity: Arc<dyn Connectivity>,
    push_lock: tokio::sync::Mutex<()>,
    state: Mutex<PushState>,
}

/// Coalescing push scheduler. Cheap to clone; clones share state.
///
/// Methods that start timers or background cycles must be called from
/// within a tokio runtime.
#[derive(Clone)]
pub struct FastPushService {
    inner: Arc<Inner>,
}

impl FastPushService {
    pub fn new(
        settings: SharedSettings,
        pusher: Arc<dyn PushExecutor>,
        full_sync: Arc<dyn FullSyncRunner>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                pusher,
                full_sync,
                connectivity,
                push_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(PushState::default()),
            }),
        }
    }

    fn settings(&self) -> SyncSettings {
        self.inner.settings.read().clone()
    }

    /// Record one new local mutation. Never fails; push errors are logged.
    pub fn notify_mutation_added(&self) {
        let settings = self.settings();
        let mut state = self.inner.state.lock();
        state.metrics.mutations_coalesced += 1;
        state.buffered += 1;

        if !settings.fast_push_only {
            state.cancel_debounce();
            drop(state);
            self.spawn_push_cycle();
            return;
        }

        if state.buffered >= settings.fast_push_max_buffer_size {
            tracing::debug!(buffered = state.buffered, "Push buffer full, pushing now");
            state.cancel_debounce();
            drop(state);
            self.spawn_push_cycle();
            return;
        }

        self.restart_debounce(&mut state, settings.fast_push_debounce);
    }

    fn restart_debounce(&self, state: &mut PushState, delay: Duration) {
        state.cancel_debounce();
        let generation = state.debounce_generation;
        let service = self.clone();
        state.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = service.inner.state.lock();
                if state.debounce_generation != generation {
                    return;
                }
                // past this point the cycle is no longer cancellable
                state.debounce = None;
            }
            service.run_push_cycle().await;
        }));
    }

    fn spawn_push_cycle(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            service.run_push_cycle().await;
        });
    }

    /// Push immediately, bypassing the debounce window
    pub async fn flush_now(&self) -> PushOutcome {
        self.inner.state.lock().cancel_debounce();
        self.run_push_cycle().await
    }

    /// Flush whatever accumulated while offline
    pub async fn on_connectivity_restored(&self) -> Option<PushOutcome> {
        let buffered = {
            let mut state = self.inner.state.lock();
            if state.buffered == 0 {
                return None;
            }
            state.cancel_debounce();
            state.buffered
        };
        tracing::info!(buffered, "Connectivity restored, flushing buffered mutations");
        Some(self.run_push_cycle().await)
    }

    async fn run_push_cycle(&self) -> PushOutcome {
        let guard = {
            let mut state = self.inner.state.lock();
            match self.inner.push_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    state.rerun_requested = true;
                    tracing::debug!("Push in flight, request merged into follow-up cycle");
                    return PushOutcome::Deferred;
                }
            }
        };

        loop {
            let outcome = self.push_once().await;
            let mut state = self.inner.state.lock();
            if !std::mem::take(&mut state.rerun_requested) {
                drop(guard);
                return outcome;
            }
        }
    }

    async fn push_once(&self) -> PushOutcome {
        let status = self.inner.connectivity.status().await;
        if !status.is_connected {
            let mut state = self.inner.state.lock();
            state.metrics.pushes_skipped_offline += 1;
            tracing::debug!(buffered = state.buffered, "Offline, push deferred");
            return PushOutcome::SkippedOffline;
        }

        let drained = std::mem::take(&mut self.inner.state.lock().buffered);

        match self.inner.pusher.push().await {
            Ok(report) => {
                {
                    let mut state = self.inner.state.lock();
                    state.metrics.push_count += 1;
                    state.metrics.last_push_at = Some(Utc::now());
                }
                tracing::info!(
                    pushed = report.pushed,
                    failed = report.failed,
                    coalesced = drained,
                    "Fast push completed"
                );

                let settings = self.settings();
                if !settings.fast_push_only {
                    self.execute_full_sync().await;
                } else if settings.fast_push_schedule_full_sync {
                    self.schedule_full_sync();
                }
                PushOutcome::Pushed(report)
            }
            Err(e) => {
                {
                    let mut state = self.inner.state.lock();
                    state.metrics.push_failures += 1;
                    state.buffered += drained;
                }
                tracing::warn!(error = %e, transient = e.is_transient(), "Fast push failed");
                PushOutcome::Failed(e.to_string())
            }
        }
    }

    /// Schedule a background full sync unless one is pending or the
    /// throttle window is still open
    pub fn schedule_full_sync(&self) -> FullSyncSchedule {
        let settings = self.settings();
        let mut state = self.inner.state.lock();

        if state.metrics.scheduled_full_sync_pending {
            return FullSyncSchedule::AlreadyScheduled;
        }

        let remaining = throttle_remaining_at(state.last_full_sync_at, settings.full_sync_throttle, Instant::now());
        if !remaining.is_zero() {
            state.metrics.full_syncs_throttled += 1;
            tracing::debug!(remaining_ms = whole_millis(remaining), "Full sync throttled");
            return FullSyncSchedule::Throttled { remaining };
        }

        state.metrics.scheduled_full_sync_pending = true;
        let delay = settings.full_sync_schedule_delay;
        let service = self.clone();
        state.scheduled_full_sync = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            service.run_scheduled_full_sync().await;
        }));
        FullSyncSchedule::Scheduled
    }

    async fn run_scheduled_full_sync(&self) {
        // started; cancel_all no longer reaches this run
        self.inner.state.lock().scheduled_full_sync = None;

        if self.settings().full_sync_prefer_wifi {
            let status = self.inner.connectivity.status().await;
            if !status.is_connected || !status.is_wifi() {
                let mut state = self.inner.state.lock();
                state.metrics.full_syncs_deferred += 1;
                state.metrics.scheduled_full_sync_pending = false;
                tracing::debug!(connection_type = ?status.connection_type, "Full sync deferred until wifi");
                return;
            }
        }

        self.execute_full_sync().await;
        self.inner.state.lock().metrics.scheduled_full_sync_pending = false;
    }

    async fn execute_full_sync(&self) {
        match self.inner.full_sync.run_full_sync().await {
            Ok(()) => {
                let mut state = self.inner.state.lock();
                state.last_full_sync_at = Some(Instant::now());
                state.metrics.full_syncs_run += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Scheduled full sync failed");
            }
        }
    }

    /// Record a full sync that ran outside the scheduler
    pub fn mark_full_sync_completed(&self) {
        self.inner.state.lock().last_full_sync_at = Some(Instant::now());
    }

    pub fn can_execute_full_sync(&self) -> bool {
        self.throttle_remaining().is_zero()
    }

    pub fn throttle_remaining(&self) -> Duration {
        let throttle = self.inner.settings.read().full_sync_throttle;
        let last = self.inner.state.lock().last_full_sync_at;
        throttle_remaining_at(last, throttle, Instant::now())
    }

    /// Drop the debounce timer, any not-yet-started full sync and the buffer
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock();
        state.cancel_debounce();
        if let Some(handle) = state.scheduled_full_sync.take() {
            handle.abort();
            state.metrics.scheduled_full_sync_pending = false;
        }
        state.buffered = 0;
        state.rerun_requested = false;
    }

    /// Replace the shared settings; applies to the next timer or cycle
    pub fn configure(&self, settings: SyncSettings) -> SyncResult<()> {
        settings.validate()?;
        *self.inner.settings.write() = settings;
        Ok(())
    }

    pub fn metrics(&self) -> FastPushMetrics {
        self.inner.state.lock().metrics.clone()
    }

    pub fn reset_metrics(&self) {
        let mut state = self.inner.state.lock();
        let pending = state.metrics.scheduled_full_sync_pending;
        state.metrics = FastPushMetrics {
            scheduled_full_sync_pending: pending,
            ..FastPushMetrics::default()
        };
    }

    /// Notifications not yet covered by a successful push
    pub fn buffered(&self) -> usize {
        self.inner.state.lock().buffered
    }

    pub fn has_pending_debounce(&self) -> bool {
        self.inner.state.lock().debounce.is_some()
    }
}
