//! Pull-and-reconcile engine
//!
//! A cycle for one entity:
//! 1. Page through the pull endpoint until `hasMore` is false
//! 2. Build a skip-set from the entity's PENDING and PROCESSING mutations
//! 3. Drop remote items whose id is in the skip-set (the local edit wins
//!    until the server acknowledges it)
//! 4. Transform the rest into storage rows and upsert them, in chunks with a
//!    yield between chunks once the batch exceeds `chunk_size`
//! 5. Record save metrics
//!
//! The engine reads the mutation queue but never writes to it.

use crate::config::SharedSettings;
use crate::error::{SyncError, SyncResult};
use crate::fast_push::FullSyncRunner;
use crate::local_store::{LocalStore, StorageValue, WriteStatement};
use crate::metrics::{SaveMetrics, SyncMetrics};
use crate::mutation_queue::MutationQueue;
use crate::registry::{EntityRegistry, SyncEntityConfig};
use crate::remote_api::RemoteApi;
use crate::sync_triggers::SyncActionHandler;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Result of reconciling one entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySyncReport {
    pub entity: String,
    pub correlation_id: Option<Uuid>,
    pub fetched: usize,
    pub written: usize,
    pub skipped: usize,
    pub chunk_count: usize,
    pub used_chunk_processing: bool,
}

/// Result of reconciling every registered entity
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FullSyncReport {
    pub entities: Vec<EntitySyncReport>,
    /// (entity, error message) for entities whose cycle aborted
    pub failures: Vec<(String, String)>,
}

impl FullSyncReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Outcome of a targeted single-record refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SingleSyncOutcome {
    Written,
    /// A local mutation on this id is queued or mid-push
    SkippedPending,
    NotFound,
}

/// How a batch of rows will be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub used_chunk_processing: bool,
    pub chunk_count: usize,
}

impl ChunkPlan {
    /// Chunking kicks in only when `rows` strictly exceeds `chunk_size`
    pub fn for_rows(rows: usize, chunk_size: usize, chunk_processing: bool) -> Self {
        let chunk_size = chunk_size.max(1);
        if chunk_processing && rows > chunk_size {
            Self {
                used_chunk_processing: true,
                chunk_count: rows.div_ceil(chunk_size),
            }
        } else {
            Self {
                used_chunk_processing: false,
                chunk_count: usize::from(rows > 0),
            }
        }
    }
}

/// Id of a remote item as a string, whatever its JSON type
pub fn item_id(item: &Value, id_field: &str) -> Option<String> {
    match item.get(id_field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Storage-row tuples in column order
pub fn build_rows<'a, I>(items: I, columns: &[String]) -> Vec<Vec<StorageValue>>
where
    I: IntoIterator<Item = &'a Value>,
{
    items
        .into_iter()
        .map(|item| {
            columns
                .iter()
                .map(|column| StorageValue::from_json(item.get(column)))
                .collect()
        })
        .collect()
}

/// Rows for a batch, built chunk by chunk when `chunk_size` is given.
/// The output is identical either way.
pub fn storage_rows(items: &[&Value], columns: &[String], chunk_size: Option<usize>) -> Vec<Vec<StorageValue>> {
    match chunk_size {
        Some(size) => items
            .chunks(size.max(1))
            .flat_map(|chunk| build_rows(chunk.iter().copied(), columns))
            .collect(),
        None => build_rows(items.iter().copied(), columns),
    }
}

fn estimated_bytes(rows: &[Vec<StorageValue>]) -> usize {
    rows.iter().flatten().map(StorageValue::estimated_size).sum()
}

async fn yield_between_chunks(delay: Duration) {
    if delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(delay).await;
    }
}

/// Per-entity puller writing into the local store
pub struct SyncEngine {
    registry: EntityRegistry,
    api: Arc<dyn RemoteApi>,
    queue: Arc<dyn MutationQueue>,
    store: Arc<dyn LocalStore>,
    settings: SharedSettings,
    metrics: Arc<SyncMetrics>,
}

impl SyncEngine {
    pub fn new(
        registry: EntityRegistry,
        api: Arc<dyn RemoteApi>,
        queue: Arc<dyn MutationQueue>,
        store: Arc<dyn LocalStore>,
        settings: SharedSettings,
    ) -> Self {
        Self {
            registry,
            api,
            queue,
            store,
            settings,
            metrics: Arc::new(SyncMetrics::new()),
        }
    }

    pub fn register_entity(&self, config: SyncEntityConfig) -> SyncResult<()> {
        self.registry.register(config)
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Pull every page of one entity and reconcile it into the local store
    pub async fn sync_entity(&self, name: &str) -> SyncResult<EntitySyncReport> {
        let config = self.registry.get(name)?;
        let items = self.fetch_all(&config).await?;

        if items.is_empty() {
            tracing::debug!(entity = %config.name, "Remote returned no items");
            return Ok(EntitySyncReport {
                entity: config.name,
                ..EntitySyncReport::default()
            });
        }

        let skip_set = self.queue.unsynced_entity_ids(&config.name).await?;
        self.save_to_local_db(&config, &items, &skip_set).await
    }

    /// Refresh one record, leaving it alone while a local edit is unacknowledged
    pub async fn sync_single(&self, name: &str, entity_id: &str) -> SyncResult<SingleSyncOutcome> {
        let config = self.registry.get(name)?;

        let skip_set = self.queue.unsynced_entity_ids(&config.name).await?;
        if skip_set.contains(entity_id) {
            tracing::debug!(entity = %config.name, entity_id, "Skipping single sync, local mutation pending");
            return Ok(SingleSyncOutcome::SkippedPending);
        }

        let Some(item) = self.api.fetch_item(&config.api_endpoint, entity_id).await? else {
            return Ok(SingleSyncOutcome::NotFound);
        };

        self.save_to_local_db(&config, std::slice::from_ref(&item), &skip_set)
            .await?;
        Ok(SingleSyncOutcome::Written)
    }

    /// Every registered entity in priority order; one failure does not stop the rest
    pub async fn sync_all(&self) -> FullSyncReport {
        let mut report = FullSyncReport::default();
        for config in self.registry.by_priority() {
            match self.sync_entity(&config.name).await {
                Ok(entity_report) => report.entities.push(entity_report),
                Err(e) => {
                    tracing::warn!(entity = %config.name, error = %e, "Entity sync failed");
                    report.failures.push((config.name.clone(), e.to_string()));
                }
            }
        }
        report
    }

    async fn fetch_all(&self, config: &SyncEntityConfig) -> SyncResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut page_number: u32 = 1;

        loop {
            let page = self
                .api
                .fetch_page(&config.api_endpoint, page_number, config.batch_size)
                .await?;

            tracing::debug!(
                entity = %config.name,
                page = page_number,
                items = page.items.len(),
                has_more = page.has_more,
                total = page.total,
                "Fetched remote page"
            );

            let exhausted = page.items.is_empty();
            items.extend(page.items);

            if !page.has_more {
                break;
            }
            if exhausted {
                tracing::warn!(entity = %config.name, page = page_number, "Remote reported more pages but sent none");
                break;
            }
            page_number = page_number
                .checked_add(1)
                .ok_or_else(|| SyncError::SyncFailed(format!("page overflow for {}", config.name)))?;
        }

        Ok(items)
    }

    /// Partition, transform and write; records metrics for any non-empty batch
    pub async fn save_to_local_db(
        &self,
        config: &SyncEntityConfig,
        items: &[Value],
        skip_set: &HashSet<String>,
    ) -> SyncResult<EntitySyncReport> {
        let started = Instant::now();
        let correlation_id = Uuid::new_v4();
        let settings = self.settings.read().clone();

        let safe: Vec<&Value> = items
            .iter()
            .filter(|item| {
                item_id(item, &config.id_field).map_or(true, |id| !skip_set.contains(&id))
            })
            .collect();
        let skipped = items.len() - safe.len();

        if skipped > 0 {
            tracing::debug!(
                entity = %config.name,
                %correlation_id,
                skipped,
                "Kept local copies with pending mutations"
            );
        }

        let chunk_size = settings.chunk_size.max(1);
        let plan = ChunkPlan::for_rows(safe.len(), chunk_size, settings.chunk_processing);
        let mut chunk_durations = Vec::with_capacity(plan.chunk_count);
        let mut memory_bytes = 0;

        if !safe.is_empty() {
            self.store.ensure_table(&config.table_name, &config.columns).await?;

            if plan.used_chunk_processing {
                for (index, chunk) in safe.chunks(chunk_size).enumerate() {
                    if index > 0 {
                        yield_between_chunks(settings.chunk_yield_delay).await;
                    }
                    let chunk_started = Instant::now();
                    let rows = build_rows(chunk.iter().copied(), &config.columns);
                    memory_bytes += estimated_bytes(&rows);
                    self.store
                        .execute(WriteStatement::upsert(&config.table_name, &config.columns, &rows))
                        .await?;
                    chunk_durations.push(chunk_started.elapsed());
                }
            } else {
                let write_started = Instant::now();
                let rows = build_rows(safe.iter().copied(), &config.columns);
                memory_bytes = estimated_bytes(&rows);
                self.store
                    .execute(WriteStatement::upsert(&config.table_name, &config.columns, &rows))
                    .await?;
                chunk_durations.push(write_started.elapsed());
            }
        }

        if !items.is_empty() {
            self.metrics.record_save_to_local_db(SaveMetrics {
                correlation_id,
                entity: config.name.clone(),
                total_items: items.len(),
                safe_data_items: safe.len(),
                skipped_items: skipped,
                chunk_size,
                chunk_count: plan.chunk_count,
                chunk_durations,
                total_duration: started.elapsed(),
                used_chunk_processing: plan.used_chunk_processing,
                estimated_memory_bytes: memory_bytes,
                recorded_at: Utc::now(),
            });
        }

        Ok(EntitySyncReport {
            entity: config.name.clone(),
            correlation_id: Some(correlation_id),
            fetched: items.len(),
            written: safe.len(),
            skipped,
            chunk_count: plan.chunk_count,
            used_chunk_processing: plan.used_chunk_processing,
        })
    }
}

#[async_trait]
impl FullSyncRunner for SyncEngine {
    async fn run_full_sync(&self) -> SyncResult<()> {
        let report = self.sync_all().await;
        if report.is_success() {
            return Ok(());
        }
        let failed: Vec<&str> = report.failures.iter().map(|(entity, _)| entity.as_str()).collect();
        Err(SyncError::SyncFailed(format!("entities failed: {}", failed.join(", "))))
    }
}

#[async_trait]
impl SyncActionHandler for SyncEngine {
    async fn sync_single(&self, entity: &str, entity_id: &str) -> SyncResult<()> {
        let outcome = SyncEngine::sync_single(self, entity, entity_id).await?;
        tracing::debug!(entity, entity_id, ?outcome, "Single sync finished");
        Ok(())
    }

    async fn sync_list(&self, entity: &str) -> SyncResult<()> {
        self.sync_entity(entity).await.map(|_| ())
    }

    async fn sync_full(&self) -> SyncResult<()> {
        self.run_full_sync().await
    }
}
