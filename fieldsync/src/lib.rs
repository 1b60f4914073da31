//! Offline-first synchronization engine for the field-service mobile client
//!
//! Provides:
//! - Durable mutation queue for local writes (SQLite or in-memory)
//! - Debounced fast push of queued mutations
//! - Throttled full syncs with chunked, conflict-aware local writes
//! - Push-notification triggers with per-key debounce and a cooldown

pub mod config;
pub mod connectivity;
pub mod error;
pub mod fast_push;
pub mod local_db;
pub mod local_store;
pub mod metrics;
pub mod mutation_queue;
pub mod push_cycle;
pub mod registry;
pub mod remote_api;
pub mod sync_engine;
pub mod sync_triggers;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{FieldSyncConfig, SharedSettings, SyncSettings};
pub use connectivity::{Connectivity, ManualConnectivity, NetworkStatus};
pub use error::{SyncError, SyncResult};
pub use fast_push::{FastPushService, FullSyncRunner, FullSyncSchedule, PushExecutor, PushOutcome, PushReport};
pub use local_db::{LocalDatabase, LocalDbConfig};
pub use local_store::{LocalStore, MemoryLocalStore, StorageValue, WriteStatement};
pub use metrics::{FastPushMetrics, SaveMetrics, SyncMetrics, TriggerMetrics};
pub use mutation_queue::{InMemoryMutationQueue, Mutation, MutationQueue, MutationState, OperationType, QueueCounts};
pub use push_cycle::MutationPusher;
pub use registry::{EntityRegistry, SyncEntityConfig};
pub use remote_api::{ApiConfig, HttpRemoteApi, RemoteApi};
pub use sync_engine::{EntitySyncReport, FullSyncReport, SingleSyncOutcome, SyncEngine};
pub use sync_triggers::{PushNotificationPayload, ScopeHint, SyncAction, SyncActionHandler, SyncTriggers, TriggerOutcome};

use std::sync::Arc;
use uuid::Uuid;

/// Process-lifetime owner of the sync subsystem
pub struct SyncContext {
    settings: SharedSettings,
    registry: EntityRegistry,
    queue: Arc<dyn MutationQueue>,
    engine: Arc<SyncEngine>,
    fast_push: FastPushService,
    triggers: SyncTriggers,
}

impl SyncContext {
    /// Wire the components around the given collaborators
    pub fn new(
        settings: SyncSettings,
        api: Arc<dyn RemoteApi>,
        queue: Arc<dyn MutationQueue>,
        store: Arc<dyn LocalStore>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Self {
        let settings = settings.shared();
        let registry = EntityRegistry::new();

        let engine = Arc::new(SyncEngine::new(
            registry.clone(),
            api.clone(),
            queue.clone(),
            store,
            settings.clone(),
        ));
        let pusher = Arc::new(MutationPusher::new(registry.clone(), api, queue.clone()));
        let fast_push = FastPushService::new(settings.clone(), pusher, engine.clone(), connectivity);
        let triggers = SyncTriggers::new(settings.clone(), engine.clone());

        Self {
            settings,
            registry,
            queue,
            engine,
            fast_push,
            triggers,
        }
    }

    /// Open the SQLite database and HTTP client described by `config`
    pub async fn open(config: FieldSyncConfig, connectivity: Arc<dyn Connectivity>) -> SyncResult<Self> {
        config.sync.validate()?;
        let db = Arc::new(LocalDatabase::new(config.database).await?);

        let recovered = db.recover_interrupted().await?;
        if recovered > 0 {
            tracing::info!(recovered, "Returned interrupted mutations to the queue");
        }

        let api = Arc::new(HttpRemoteApi::new(config.api)?);
        let context = Self::new(config.sync, api, db.clone(), db, connectivity);
        for entity in config.entities {
            context.register_entity(entity)?;
        }
        Ok(context)
    }

    pub fn register_entity(&self, config: SyncEntityConfig) -> SyncResult<()> {
        self.registry.register(config)
    }

    /// Queue a local write and let fast push pick it up
    pub async fn record_mutation(
        &self,
        entity: &str,
        entity_id: &str,
        operation: OperationType,
        payload: serde_json::Value,
    ) -> SyncResult<Uuid> {
        if !self.registry.contains(entity) {
            return Err(SyncError::UnknownEntity(entity.to_string()));
        }

        let id = self
            .queue
            .enqueue(Mutation::new(entity, entity_id, operation, payload))
            .await?;
        tracing::debug!(entity, entity_id, mutation_id = %id, operation = operation.as_str(), "Recorded local mutation");

        self.fast_push.notify_mutation_added();
        Ok(id)
    }

    /// Full sync outside the scheduler; a clean run restarts the throttle window
    pub async fn sync_all(&self) -> FullSyncReport {
        let report = self.engine.sync_all().await;
        if report.is_success() {
            self.fast_push.mark_full_sync_completed();
        }
        report
    }

    pub async fn sync_entity(&self, name: &str) -> SyncResult<EntitySyncReport> {
        self.engine.sync_entity(name).await
    }

    pub async fn push_now(&self) -> PushOutcome {
        self.fast_push.flush_now().await
    }

    /// Hook for the platform's network callback on an offline-to-online
    /// transition; flushes mutations buffered while offline. `None` when
    /// nothing was waiting.
    pub async fn on_connectivity_restored(&self) -> Option<PushOutcome> {
        self.fast_push.on_connectivity_restored().await
    }

    pub fn handle_notification(&self, payload: PushNotificationPayload) {
        self.triggers.handle_notification(payload);
    }

    pub async fn queue_counts(&self) -> SyncResult<QueueCounts> {
        self.queue.counts().await
    }

    /// Stop timers and scheduled work; in-flight network calls finish
    pub fn shutdown(&self) {
        self.fast_push.cancel_all();
        self.triggers.cancel_all();
        tracing::debug!("Sync context shut down");
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn MutationQueue> {
        &self.queue
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn fast_push(&self) -> &FastPushService {
        &self.fast_push
    }

    pub fn triggers(&self) -> &SyncTriggers {
        &self.triggers
    }
}
