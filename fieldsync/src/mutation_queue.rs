//! Pending local writes awaiting upload
//!
//! The queue is the only record of edits the server has not acknowledged.
//! Push cycles claim PENDING rows (PROCESSING), then settle them as COMPLETED
//! or FAILED; a failed network call releases them back to PENDING so delivery
//! is at-least-once.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Operation type of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "CREATE",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CREATE" => Ok(OperationType::Create),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            _ => Err(SyncError::InvalidOperation(format!("Unknown operation type: {}", s))),
        }
    }
}

/// Lifecycle state of a queued mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationState::Pending => "PENDING",
            MutationState::Processing => "PROCESSING",
            MutationState::Completed => "COMPLETED",
            MutationState::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> SyncResult<Self> {
        match s {
            "PENDING" => Ok(MutationState::Pending),
            "PROCESSING" => Ok(MutationState::Processing),
            "COMPLETED" => Ok(MutationState::Completed),
            "FAILED" => Ok(MutationState::Failed),
            _ => Err(SyncError::Internal(format!("Unknown mutation state: {}", s))),
        }
    }

    /// Not yet settled by the server
    pub fn is_unsynced(&self) -> bool {
        matches!(self, MutationState::Pending | MutationState::Processing)
    }
}

/// Queue entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: Uuid,
    /// Entity type (e.g., "clients", "work_orders")
    pub entity: String,
    pub entity_id: String,
    pub operation: OperationType,
    pub payload: serde_json::Value,
    pub state: MutationState,
    pub created_at: DateTime<Utc>,
    /// Push attempts so far
    pub attempts: u32,
    /// Server rejection reason, if any
    pub last_error: Option<String>,
}

impl Mutation {
    pub fn new(
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        operation: OperationType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity: entity.into(),
            entity_id: entity_id.into(),
            operation,
            payload,
            state: MutationState::Pending,
            created_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }
}

/// Per-state row counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Durable ordered log of local writes
#[async_trait]
pub trait MutationQueue: Send + Sync {
    /// Append as PENDING; returns the mutation id
    async fn enqueue(&self, mutation: Mutation) -> SyncResult<Uuid>;

    /// PENDING mutations in insertion order, optionally for one entity
    async fn get_pending(&self, entity: Option<&str>) -> SyncResult<Vec<Mutation>>;

    /// PENDING -> PROCESSING, bumping `attempts`
    async fn mark_processing(&self, ids: &[Uuid]) -> SyncResult<()>;

    /// -> COMPLETED
    async fn mark_completed(&self, ids: &[Uuid]) -> SyncResult<()>;

    /// -> FAILED with the rejection reason
    async fn mark_failed(&self, ids: &[Uuid], reason: &str) -> SyncResult<()>;

    /// PROCESSING -> PENDING after a failed network call
    async fn release(&self, ids: &[Uuid]) -> SyncResult<()>;

    /// FAILED -> PENDING; returns how many were reset
    async fn reset_failed(&self) -> SyncResult<usize>;

    /// Every PROCESSING row back to PENDING; for startup after a crash mid-push
    async fn recover_interrupted(&self) -> SyncResult<usize>;

    /// Drop COMPLETED rows; returns how many were removed
    async fn purge_completed(&self) -> SyncResult<usize>;

    async fn counts(&self) -> SyncResult<QueueCounts>;

    /// Entity ids with a PENDING or PROCESSING mutation. Remote snapshots must
    /// not overwrite them until the server has acknowledged the local edit.
    async fn unsynced_entity_ids(&self, entity: &str) -> SyncResult<HashSet<String>>;
}


/// Process-local queue; contents are lost on exit
#[derive(Debug, Default)]
pub struct InMemoryMutationQueue {
    entries: Mutex<Vec<Mutation>>,
}

impl InMemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry regardless of state
    pub fn all(&self) -> Vec<Mutation> {
        self.entries.lock().clone()
    }

    fn transition<F>(&self, ids: &[Uuid], mut apply: F) -> usize
    where
        F: FnMut(&mut Mutation) -> bool,
    {
        let wanted: HashSet<&Uuid> = ids.iter().collect();
        let mut entries = self.entries.lock();
        entries
            .iter_mut()
            .filter(|m| wanted.contains(&m.id))
            .map(&mut apply)
            .filter(|changed| *changed)
            .count()
    }

    fn transition_all<F>(&self, mut apply: F) -> usize
    where
        F: FnMut(&mut Mutation) -> bool,
    {
        let mut entries = self.entries.lock();
        entries.iter_mut().map(&mut apply).filter(|changed| *changed).count()
    }
}

#[async_trait]
impl MutationQueue for InMemoryMutationQueue {
    async fn enqueue(&self, mut mutation: Mutation) -> SyncResult<Uuid> {
        mutation.state = MutationState::Pending;
        let id = mutation.id;
        self.entries.lock().push(mutation);
        Ok(id)
    }

    async fn get_pending(&self, entity: Option<&str>) -> SyncResult<Vec<Mutation>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|m| m.state == MutationState::Pending)
            .filter(|m| entity.map_or(true, |e| m.entity == e))
            .cloned()
            .collect())
    }

    async fn mark_processing(&self, ids: &[Uuid]) -> SyncResult<()> {
        self.transition(ids, |m| {
            if m.state != MutationState::Pending {
                return false;
            }
            m.state = MutationState::Processing;
            m.attempts = m.attempts.saturating_add(1);
            true
        });
        Ok(())
    }

    async fn mark_completed(&self, ids: &[Uuid]) -> SyncResult<()> {
        self.transition(ids, |m| {
            m.state = MutationState::Completed;
            m.last_error = None;
            true
        });
        Ok(())
    }

    async fn mark_failed(&self, ids: &[Uuid], reason: &str) -> SyncResult<()> {
        self.transition(ids, |m| {
            m.state = MutationState::Failed;
            m.last_error = Some(reason.to_string());
            true
        });
        Ok(())
    }

    async fn release(&self, ids: &[Uuid]) -> SyncResult<()> {
        self.transition(ids, |m| {
            if m.state != MutationState::Processing {
                return false;
            }
            m.state = MutationState::Pending;
            true
        });
        Ok(())
    }

    async fn reset_failed(&self) -> SyncResult<usize> {
        Ok(self.transition_all(|m| {
            if m.state != MutationState::Failed {
                return false;
            }
            m.state = MutationState::Pending;
            true
        }))
    }

    async fn recover_interrupted(&self) -> SyncResult<usize> {
        Ok(self.transition_all(|m| {
            if m.state != MutationState::Processing {
                return false;
            }
            m.state = MutationState::Pending;
            true
        }))
    }

    async fn purge_completed(&self) -> SyncResult<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|m| m.state != MutationState::Completed);
        Ok(before - entries.len())
    }

    async fn counts(&self) -> SyncResult<QueueCounts> {
        let mut counts = QueueCounts::default();
        for m in self.entries.lock().iter() {
            match m.state {
                MutationState::Pending => counts.pending += 1,
                MutationState::Processing => counts.processing += 1,
                MutationState::Completed => counts.completed += 1,
                MutationState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn unsynced_entity_ids(&self, entity: &str) -> SyncResult<HashSet<String>> {
        Ok(self
            .entries
            .lock()
            .iter()
            .filter(|m| m.entity == entity && m.state.is_unsynced())
            .map(|m| m.entity_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(entity: &str, id: &str) -> Mutation {
        Mutation::new(entity, id, OperationType::Update, json!({ "id": id }))
    }

    #[tokio::test]
    async fn test_pending_preserves_insertion_order() {
        let queue = InMemoryMutationQueue::new();
        for id in ["c", "a", "b"] {
            queue.enqueue(mutation("clients", id)).await.unwrap();
        }
        queue.enqueue(mutation("quotes", "q1")).await.unwrap();

        let pending = queue.get_pending(Some("clients")).await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|m| m.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(queue.get_pending(None).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let queue = InMemoryMutationQueue::new();
        let a = queue.enqueue(mutation("clients", "1")).await.unwrap();
        let b = queue.enqueue(mutation("clients", "2")).await.unwrap();

        queue.mark_processing(&[a, b]).await.unwrap();
        assert!(queue.get_pending(None).await.unwrap().is_empty());

        queue.mark_completed(&[a]).await.unwrap();
        queue.mark_failed(&[b], "validation failed").await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);

        assert_eq!(queue.reset_failed().await.unwrap(), 1);
        let pending = queue.get_pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("validation failed"));
    }

    #[tokio::test]
    async fn test_release_returns_processing_to_pending() {
        let queue = InMemoryMutationQueue::new();
        let a = queue.enqueue(mutation("clients", "1")).await.unwrap();
        queue.mark_processing(&[a]).await.unwrap();
        queue.release(&[a]).await.unwrap();

        let pending = queue.get_pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, MutationState::Pending);
    }

    #[tokio::test]
    async fn test_unsynced_entity_ids_and_purge() {
        let queue = InMemoryMutationQueue::new();
        let a = queue.enqueue(mutation("clients", "1")).await.unwrap();
        let b = queue.enqueue(mutation("clients", "2")).await.unwrap();
        queue.enqueue(mutation("quotes", "3")).await.unwrap();

        let ids = queue.unsynced_entity_ids("clients").await.unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("1") && ids.contains("2"));

        // claimed by a push but not yet acknowledged
        queue.mark_processing(&[a]).await.unwrap();
        let ids = queue.unsynced_entity_ids("clients").await.unwrap();
        assert!(ids.contains("1"));

        queue.mark_completed(&[a]).await.unwrap();
        queue.mark_processing(&[b]).await.unwrap();
        queue.mark_failed(&[b], "rejected").await.unwrap();
        assert!(queue.unsynced_entity_ids("clients").await.unwrap().is_empty());

        assert_eq!(queue.purge_completed().await.unwrap(), 1);
        assert_eq!(queue.all().len(), 2);
    }

    #[test]
    fn test_operation_type_parse() {
        assert_eq!(OperationType::parse("create").unwrap(), OperationType::Create);
        assert_eq!(OperationType::parse("DELETE").unwrap(), OperationType::Delete);
        assert!(OperationType::parse("upsert").is_err());
    }
}
