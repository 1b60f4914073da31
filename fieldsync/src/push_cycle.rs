//! Drains the mutation queue through each entity's mutation endpoint

use crate::error::SyncResult;
use crate::fast_push::{PushExecutor, PushReport};
use crate::mutation_queue::{Mutation, MutationQueue, MutationState};
use crate::registry::EntityRegistry;
use crate::remote_api::RemoteApi;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Push executor backed by the mutation queue and the remote API.
///
/// Must only run under the fast push lock: it is the sole writer of
/// PROCESSING state.
pub struct MutationPusher {
    registry: EntityRegistry,
    api: Arc<dyn RemoteApi>,
    queue: Arc<dyn MutationQueue>,
}

impl MutationPusher {
    pub fn new(registry: EntityRegistry, api: Arc<dyn RemoteApi>, queue: Arc<dyn MutationQueue>) -> Self {
        Self { registry, api, queue }
    }

    async fn push_batch(&self, endpoint: &str, batch: &mut [Mutation]) -> SyncResult<PushReport> {
        let ids: Vec<Uuid> = batch.iter().map(|m| m.id).collect();
        self.queue.mark_processing(&ids).await?;
        for mutation in batch.iter_mut() {
            mutation.state = MutationState::Processing;
            mutation.attempts = mutation.attempts.saturating_add(1);
        }

        let response = match self.api.push_mutations(endpoint, batch).await {
            Ok(response) => response,
            Err(e) if e.is_rejection() => {
                tracing::warn!(endpoint, count = ids.len(), error = %e, "Server refused mutation batch");
                self.queue.mark_failed(&ids, &e.to_string()).await?;
                return Ok(PushReport {
                    pushed: 0,
                    failed: ids.len(),
                });
            }
            Err(e) => {
                // back to PENDING so the next cycle retries
                self.queue.release(&ids).await?;
                return Err(e);
            }
        };

        let sent: HashSet<Uuid> = ids.iter().copied().collect();
        let accepted: Vec<Uuid> = response.accepted.iter().copied().filter(|id| sent.contains(id)).collect();
        self.queue.mark_completed(&accepted).await?;

        let mut failed = 0;
        for rejection in response.rejected.iter().filter(|r| sent.contains(&r.id)) {
            self.queue
                .mark_failed(std::slice::from_ref(&rejection.id), &rejection.reason)
                .await?;
            failed += 1;
        }

        let answered: HashSet<Uuid> = response
            .accepted
            .iter()
            .copied()
            .chain(response.rejected.iter().map(|r| r.id))
            .collect();
        let unanswered: Vec<Uuid> = ids.iter().copied().filter(|id| !answered.contains(id)).collect();
        if !unanswered.is_empty() {
            tracing::warn!(endpoint, count = unanswered.len(), "Server left mutations unanswered, releasing");
            self.queue.release(&unanswered).await?;
        }

        Ok(PushReport {
            pushed: accepted.len(),
            failed,
        })
    }
}

/// Pending mutations grouped by entity, groups in order of first appearance
fn group_by_entity(pending: Vec<Mutation>) -> Vec<(String, Vec<Mutation>)> {
    let mut groups: Vec<(String, Vec<Mutation>)> = Vec::new();
    for mutation in pending {
        match groups.iter_mut().find(|(entity, _)| *entity == mutation.entity) {
            Some((_, batch)) => batch.push(mutation),
            None => groups.push((mutation.entity.clone(), vec![mutation])),
        }
    }
    groups
}

#[async_trait]
impl PushExecutor for MutationPusher {
    async fn push(&self) -> SyncResult<PushReport> {
        let pending = self.queue.get_pending(None).await?;
        if pending.is_empty() {
            return Ok(PushReport::default());
        }

        let mut report = PushReport::default();
        let mut first_error = None;
        for (entity, mutations) in group_by_entity(pending) {
            let config = match self.registry.get(&entity) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(entity = %entity, count = mutations.len(), "Dropping mutations for unregistered entity");
                    let ids: Vec<Uuid> = mutations.iter().map(|m| m.id).collect();
                    self.queue.mark_failed(&ids, &e.to_string()).await?;
                    report.failed += ids.len();
                    continue;
                }
            };

            let mut mutations = mutations;
            for batch in mutations.chunks_mut(config.batch_size.max(1)) {
                let batch_report = match self.push_batch(&config.api_mutation_endpoint, batch).await {
                    Ok(batch_report) => batch_report,
                    Err(e) => {
                        // later batches of this entity stay PENDING; other entities still go out
                        tracing::warn!(entity = %entity, error = %e, "Mutation push failed for entity");
                        first_error.get_or_insert(e);
                        break;
                    }
                };
                tracing::debug!(
                    entity = %entity,
                    pushed = batch_report.pushed,
                    failed = batch_report.failed,
                    "Pushed mutation batch"
                );
                report.pushed += batch_report.pushed;
                report.failed += batch_report.failed;
            }
        }

        match first_error {
            Some(e) => {
                tracing::info!(
                    pushed = report.pushed,
                    failed = report.failed,
                    "Push cycle finished with entities left for retry"
                );
                Err(e)
            }
            None => Ok(report),
        }
    }
}
