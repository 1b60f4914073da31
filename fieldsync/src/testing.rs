//! In-process fakes for the external collaborators

use crate::error::{SyncError, SyncResult};
use crate::mutation_queue::Mutation;
use crate::remote_api::{PushResponse, RejectedMutation, RemoteApi, RemotePage};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Serves canned snapshot data and records pushes
#[derive(Default)]
pub(crate) struct FakeRemoteApi {
    datasets: Mutex<HashMap<String, Vec<Value>>>,
    rejected_entity_ids: Mutex<HashSet<String>>,
    pushes: Mutex<Vec<(String, Vec<Mutation>)>>,
    failing_push_endpoints: Mutex<HashMap<String, u16>>,
    pub(crate) fail_pull: AtomicBool,
    pub(crate) fail_push: AtomicBool,
    pub(crate) page_requests: AtomicUsize,
}

impl FakeRemoteApi {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_dataset(&self, endpoint: &str, items: Vec<Value>) {
        self.datasets.lock().insert(endpoint.to_string(), items);
    }

    /// Mutations on these entity ids are rejected by the fake server
    pub(crate) fn reject_entity_id(&self, entity_id: &str) {
        self.rejected_entity_ids.lock().insert(entity_id.to_string());
    }

    /// Pushes to `endpoint` answer with `status` and are not recorded
    pub(crate) fn fail_push_endpoint(&self, endpoint: &str, status: u16) {
        self.failing_push_endpoints.lock().insert(endpoint.to_string(), status);
    }

    pub(crate) fn pushes(&self) -> Vec<(String, Vec<Mutation>)> {
        self.pushes.lock().clone()
    }
}

#[async_trait]
impl RemoteApi for FakeRemoteApi {
    async fn fetch_page(&self, endpoint: &str, page: u32, limit: usize) -> SyncResult<RemotePage> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(SyncError::Network("connection reset".into()));
        }

        let datasets = self.datasets.lock();
        let all = datasets.get(endpoint).cloned().unwrap_or_default();
        let start = (page.saturating_sub(1) as usize) * limit;
        let end = (start + limit).min(all.len());
        let items = if start < all.len() { all[start..end].to_vec() } else { Vec::new() };

        Ok(RemotePage {
            items,
            has_more: end < all.len(),
            total: all.len() as u64,
        })
    }

    async fn fetch_item(&self, endpoint: &str, id: &str) -> SyncResult<Option<Value>> {
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(SyncError::Network("connection reset".into()));
        }
        let datasets = self.datasets.lock();
        Ok(datasets.get(endpoint).and_then(|items| {
            items
                .iter()
                .find(|item| item.get("id").and_then(Value::as_str) == Some(id))
                .cloned()
        }))
    }

    async fn push_mutations(&self, endpoint: &str, mutations: &[Mutation]) -> SyncResult<PushResponse> {
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(SyncError::Network("timeout".into()));
        }
        if let Some(status) = self.failing_push_endpoints.lock().get(endpoint).copied() {
            return Err(SyncError::HttpStatus {
                status,
                url: endpoint.to_string(),
            });
        }
        self.pushes.lock().push((endpoint.to_string(), mutations.to_vec()));

        let rejected_ids = self.rejected_entity_ids.lock();
        let mut response = PushResponse::default();
        for mutation in mutations {
            if rejected_ids.contains(&mutation.entity_id) {
                response.rejected.push(RejectedMutation {
                    id: mutation.id,
                    reason: "validation failed".into(),
                });
            } else {
                response.accepted.push(mutation.id);
            }
        }
        Ok(response)
    }
}
