//! Push-notification driven syncs
//!
//! A notification names an entity and a scope hint; it is routed to a
//! single-record, list or full sync. Bursts for the same dedup key collapse
//! into one execution after `trigger_debounce`, and a global cooldown after
//! every executed sync rejects further work without touching the network.

use crate::config::SharedSettings;
use crate::error::SyncResult;
use crate::metrics::{whole_millis, TriggerMetrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Event type that always forces a full sync
pub const FULL_REQUIRED_EVENT: &str = "sync.full_required";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeHint {
    Single,
    List,
    Full,
}

/// Payload delivered by the push transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotificationPayload {
    pub event_type: String,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    pub scope_hint: ScopeHint,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl PushNotificationPayload {
    fn is_full_required(&self) -> bool {
        self.event_type == FULL_REQUIRED_EVENT
    }

    /// Routed sync for this payload
    pub fn action(&self) -> SyncAction {
        if self.is_full_required() {
            return SyncAction::Full;
        }
        match (self.scope_hint, self.entity_id.as_deref()) {
            (ScopeHint::Single, Some(id)) if !id.is_empty() => SyncAction::Single {
                entity: self.entity.clone(),
                entity_id: id.to_string(),
            },
            (ScopeHint::Single, _) | (ScopeHint::List, _) => SyncAction::List {
                entity: self.entity.clone(),
            },
            (ScopeHint::Full, _) => SyncAction::Full,
        }
    }

    /// Payloads sharing a key are debounced together
    pub fn dedup_key(&self) -> String {
        if self.is_full_required() {
            return "*".to_string();
        }
        match self.action() {
            SyncAction::Single { entity, entity_id } => format!("{}:{}", entity, entity_id),
            SyncAction::List { entity } => entity,
            SyncAction::Full => {
                if self.entity.is_empty() {
                    "*".to_string()
                } else {
                    self.entity.clone()
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncAction {
    Single { entity: String, entity_id: String },
    List { entity: String },
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Executed,
    Blocked { remaining: Duration },
    Failed(String),
}

/// Performs the routed syncs
#[async_trait]
pub trait SyncActionHandler: Send + Sync {
    async fn sync_single(&self, entity: &str, entity_id: &str) -> SyncResult<()>;
    async fn sync_list(&self, entity: &str) -> SyncResult<()>;
    async fn sync_full(&self) -> SyncResult<()>;
}

struct PendingTrigger {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TriggerState {
    pending: HashMap<String, PendingTrigger>,
    next_generation: u64,
    executing: bool,
    last_completed_at: Option<Instant>,
    metrics: TriggerMetrics,
}

struct TriggerInner {
    settings: SharedSettings,
    handler: Arc<dyn SyncActionHandler>,
    state: Mutex<TriggerState>,
}

/// Debounced, cooldown-guarded router for push notifications
#[derive(Clone)]
pub struct SyncTriggers {
    inner: Arc<TriggerInner>,
}

impl SyncTriggers {
    pub fn new(settings: SharedSettings, handler: Arc<dyn SyncActionHandler>) -> Self {
        Self {
            inner: Arc::new(TriggerInner {
                settings,
                handler,
                state: Mutex::new(TriggerState::default()),
            }),
        }
    }

    /// Queue a payload behind its key's debounce timer
    pub fn handle_notification(&self, payload: PushNotificationPayload) {
        let key = payload.dedup_key();
        let delay = self.inner.settings.read().trigger_debounce;

        let mut state = self.inner.state.lock();
        state.metrics.received += 1;
        if let Some(previous) = state.pending.remove(&key) {
            previous.handle.abort();
            state.metrics.coalesced += 1;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let event_type = payload.event_type.clone();
        let triggers = self.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut state = triggers.inner.state.lock();
                match state.pending.get(&task_key) {
                    Some(pending) if pending.generation == generation => {
                        state.pending.remove(&task_key);
                    }
                    _ => return,
                }
            }
            triggers.execute(payload.action()).await;
        });

        tracing::debug!(key = %key, event_type = %event_type, "Push notification debounced");
        state.pending.insert(key, PendingTrigger { generation, handle });
    }

    /// Route and execute immediately, still subject to the cooldown
    pub async fn dispatch(&self, payload: &PushNotificationPayload) -> TriggerOutcome {
        self.inner.state.lock().metrics.received += 1;
        self.execute(payload.action()).await
    }

    async fn execute(&self, action: SyncAction) -> TriggerOutcome {
        let cooldown = self.inner.settings.read().trigger_cooldown;
        {
            let mut state = self.inner.state.lock();
            let remaining = if state.executing {
                Some(cooldown)
            } else {
                state
                    .last_completed_at
                    .map(|last| (last + cooldown).saturating_duration_since(Instant::now()))
                    .filter(|remaining| !remaining.is_zero())
            };
            if let Some(remaining) = remaining {
                state.metrics.blocked += 1;
                tracing::debug!(?action, remaining_ms = whole_millis(remaining), "Triggered sync blocked");
                return TriggerOutcome::Blocked { remaining };
            }
            state.executing = true;
        }

        let handler = &self.inner.handler;
        let result = match &action {
            SyncAction::Single { entity, entity_id } => handler.sync_single(entity, entity_id).await,
            SyncAction::List { entity } => handler.sync_list(entity).await,
            SyncAction::Full => handler.sync_full().await,
        };

        let mut state = self.inner.state.lock();
        state.executing = false;
        state.last_completed_at = Some(Instant::now());
        match result {
            Ok(()) => {
                state.metrics.executed += 1;
                tracing::info!(?action, "Triggered sync completed");
                TriggerOutcome::Executed
            }
            Err(e) => {
                state.metrics.failed += 1;
                tracing::warn!(?action, error = %e, "Triggered sync failed");
                TriggerOutcome::Failed(e.to_string())
            }
        }
    }

    /// Drop every pending debounce timer; a running sync is not interrupted
    pub fn cancel_all(&self) {
        let mut state = self.inner.state.lock();
        for (_, pending) in state.pending.drain() {
            pending.handle.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn metrics(&self) -> TriggerMetrics {
        self.inner.state.lock().metrics.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<SyncAction>>,
        latency: Mutex<Duration>,
        fail: AtomicBool,
    }

    impl RecordingHandler {
        async fn record(&self, action: SyncAction) -> SyncResult<()> {
            self.calls.lock().push(action);
            let latency = *self.latency.lock();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncError::Network("gateway timeout".into()));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<SyncAction> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl SyncActionHandler for RecordingHandler {
        async fn sync_single(&self, entity: &str, entity_id: &str) -> SyncResult<()> {
            self.record(SyncAction::Single {
                entity: entity.to_string(),
                entity_id: entity_id.to_string(),
            })
            .await
        }

        async fn sync_list(&self, entity: &str) -> SyncResult<()> {
            self.record(SyncAction::List { entity: entity.to_string() }).await
        }

        async fn sync_full(&self) -> SyncResult<()> {
            self.record(SyncAction::Full).await
        }
    }

    fn payload(event_type: &str, entity: &str, entity_id: Option<&str>, scope_hint: ScopeHint) -> PushNotificationPayload {
        PushNotificationPayload {
            event_type: event_type.to_string(),
            entity: entity.to_string(),
            entity_id: entity_id.map(str::to_string),
            action: Some("updated".to_string()),
            scope_hint,
            timestamp: None,
        }
    }

    fn triggers() -> (SyncTriggers, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        let triggers = SyncTriggers::new(SyncSettings::default().shared(), handler.clone());
        (triggers, handler)
    }

    #[test]
    fn test_routing() {
        let single = payload("quote.updated", "quotes", Some("q1"), ScopeHint::Single);
        assert_eq!(
            single.action(),
            SyncAction::Single { entity: "quotes".into(), entity_id: "q1".into() }
        );

        let no_id = payload("quote.updated", "quotes", None, ScopeHint::Single);
        assert_eq!(no_id.action(), SyncAction::List { entity: "quotes".into() });

        let list = payload("quote.created", "quotes", Some("q1"), ScopeHint::List);
        assert_eq!(list.action(), SyncAction::List { entity: "quotes".into() });

        let full = payload(FULL_REQUIRED_EVENT, "quotes", Some("q1"), ScopeHint::Single);
        assert_eq!(full.action(), SyncAction::Full);
    }

    #[test]
    fn test_dedup_keys() {
        assert_eq!(payload("x", "quotes", Some("q1"), ScopeHint::Single).dedup_key(), "quotes:q1");
        assert_eq!(payload("x", "quotes", None, ScopeHint::Single).dedup_key(), "quotes");
        assert_eq!(payload("x", "quotes", None, ScopeHint::List).dedup_key(), "quotes");
        assert_eq!(payload("x", "quotes", None, ScopeHint::Full).dedup_key(), "quotes");
        assert_eq!(payload(FULL_REQUIRED_EVENT, "quotes", None, ScopeHint::List).dedup_key(), "*");
    }

    #[test]
    fn test_payload_wire_shape() {
        let raw = r#"{
            "eventType": "work_order.updated",
            "entity": "work_orders",
            "entityId": "w1",
            "action": "updated",
            "scopeHint": "single",
            "timestamp": "2024-05-01T10:00:00Z"
        }"#;
        let parsed: PushNotificationPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.entity_id.as_deref(), Some("w1"));
        assert_eq!(parsed.scope_hint, ScopeHint::Single);
        assert!(parsed.timestamp.is_some());

        let minimal: PushNotificationPayload =
            serde_json::from_str(r#"{"eventType":"sync.full_required","scopeHint":"full"}"#).unwrap();
        assert_eq!(minimal.action(), SyncAction::Full);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_executes_final_payload_once() {
        let (triggers, handler) = triggers();

        triggers.handle_notification(payload("quote.updated", "quotes", None, ScopeHint::List));
        tokio::time::sleep(Duration::from_millis(200)).await;
        triggers.handle_notification(payload("quote.updated", "quotes", None, ScopeHint::List));
        tokio::time::sleep(Duration::from_millis(200)).await;
        triggers.handle_notification(payload("quote.bulk", "quotes", None, ScopeHint::Full));
        assert_eq!(triggers.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(handler.calls(), vec![SyncAction::Full]);

        let metrics = triggers.metrics();
        assert_eq!(metrics.received, 3);
        assert_eq!(metrics.coalesced, 2);
        assert_eq!(metrics.executed, 1);
        assert_eq!(triggers.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_blocks_without_io() {
        let (triggers, handler) = triggers();
        let list = payload("client.updated", "clients", None, ScopeHint::List);

        assert_eq!(triggers.dispatch(&list).await, TriggerOutcome::Executed);
        match triggers.dispatch(&list).await {
            TriggerOutcome::Blocked { remaining } => assert!(remaining <= Duration::from_secs(2)),
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert_eq!(handler.calls().len(), 1);

        tokio::time::sleep(Duration::from_millis(2_001)).await;
        assert_eq!(triggers.dispatch(&list).await, TriggerOutcome::Executed);
        assert_eq!(triggers.metrics().blocked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_executing_sync_blocks_others() {
        let (triggers, handler) = triggers();
        *handler.latency.lock() = Duration::from_secs(1);

        let running = triggers.clone();
        let first = tokio::spawn(async move {
            running
                .dispatch(&payload("sync.full_required", "", None, ScopeHint::Full))
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = triggers
            .dispatch(&payload("quote.updated", "quotes", Some("q1"), ScopeHint::Single))
            .await;
        assert!(matches!(outcome, TriggerOutcome::Blocked { .. }));
        assert_eq!(first.await.unwrap(), TriggerOutcome::Executed);
        assert_eq!(handler.calls(), vec![SyncAction::Full]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_counted() {
        let (triggers, handler) = triggers();
        handler.fail.store(true, Ordering::SeqCst);

        let outcome = triggers
            .dispatch(&payload("quote.updated", "quotes", Some("q1"), ScopeHint::Single))
            .await;
        assert!(matches!(outcome, TriggerOutcome::Failed(_)));
        assert_eq!(triggers.metrics().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_drops_pending_timers() {
        let (triggers, handler) = triggers();
        triggers.handle_notification(payload("a", "quotes", Some("q1"), ScopeHint::Single));
        triggers.handle_notification(payload("b", "clients", None, ScopeHint::List));
        assert_eq!(triggers.pending_count(), 2);

        triggers.cancel_all();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(triggers.pending_count(), 0);
        assert!(handler.calls().is_empty());
    }
}
