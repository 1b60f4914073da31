//! HTTP collaborator for pulling snapshots and pushing mutations
//!
//! Wire shapes:
//! - Pull: `GET {base}{endpoint}?page=N&limit=M` -> `{ items, hasMore, total }`
//! - Single: `GET {base}{endpoint}/{id}` -> item, 404 when absent
//! - Push: `POST {base}{mutation_endpoint}` `{ mutations }` -> `{ accepted, rejected }`

use crate::error::{SyncError, SyncResult};
use crate::mutation_queue::Mutation;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Remote API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Server base URL
    pub base_url: String,
    /// Bearer token
    pub auth_token: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            auth_token: None,
            timeout_secs: 30,
        }
    }
}

/// One page of remote snapshot items
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePage {
    pub items: Vec<serde_json::Value>,
    pub has_more: bool,
    #[serde(default)]
    pub total: u64,
}

/// Push request body
#[derive(Debug, Serialize)]
pub struct PushRequest<'a> {
    pub mutations: &'a [Mutation],
}

/// Server verdict on a pushed batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Mutation ids the server applied
    #[serde(default)]
    pub accepted: Vec<Uuid>,
    /// Mutation ids the server refused
    #[serde(default)]
    pub rejected: Vec<RejectedMutation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedMutation {
    pub id: Uuid,
    #[serde(default)]
    pub reason: String,
}

/// Source of truth the engine reconciles against
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Pages are numbered from 1
    async fn fetch_page(&self, endpoint: &str, page: u32, limit: usize) -> SyncResult<RemotePage>;

    /// `None` when the server no longer has the item
    async fn fetch_item(&self, endpoint: &str, id: &str) -> SyncResult<Option<serde_json::Value>>;

    async fn push_mutations(&self, endpoint: &str, mutations: &[Mutation]) -> SyncResult<PushResponse>;
}

/// reqwest-backed implementation
#[derive(Debug, Clone)]
pub struct HttpRemoteApi {
    config: ApiConfig,
    client: reqwest::Client,
}

impl HttpRemoteApi {
    pub fn new(config: ApiConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    /// `{base}{endpoint}/{id}` with `id` percent-encoded as one path segment
    fn item_url(&self, endpoint: &str, id: &str) -> SyncResult<reqwest::Url> {
        let base = self.url(endpoint);
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| SyncError::InvalidConfig(format!("Invalid URL {}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidConfig(format!("URL cannot take a path: {}", base)))?
            .pop_if_empty()
            .push(id);
        Ok(url)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemoteApi {
    async fn fetch_page(&self, endpoint: &str, page: u32, limit: usize) -> SyncResult<RemotePage> {
        let url = self.url(endpoint);
        let response = self
            .authorize(self.client.get(&url))
            .query(&[("page", page.to_string()), ("limit", limit.to_string())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }

        Ok(response.json::<RemotePage>().await?)
    }

    async fn fetch_item(&self, endpoint: &str, id: &str) -> SyncResult<Option<serde_json::Value>> {
        let url = self.item_url(endpoint, id)?;
        let response = self.authorize(self.client.get(url.clone())).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SyncError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        Ok(Some(response.json::<serde_json::Value>().await?))
    }

    async fn push_mutations(&self, endpoint: &str, mutations: &[Mutation]) -> SyncResult<PushResponse> {
        let url = self.url(endpoint);
        let response = self
            .authorize(self.client.post(&url))
            .json(&PushRequest { mutations })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::HttpStatus {
                status: response.status().as_u16(),
                url,
            });
        }

        Ok(response.json::<PushResponse>().await?)
    }
}
