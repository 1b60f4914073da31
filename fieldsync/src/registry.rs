//! Registered entity types and their storage/API coordinates

use crate::error::{SyncError, SyncResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Static registration record for one synced entity type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntityConfig {
    /// Entity name used by the mutation queue and push payloads
    pub name: String,
    /// Local table the snapshot rows land in
    pub table_name: String,
    /// Paginated pull endpoint
    pub api_endpoint: String,
    /// Endpoint accepting pushed mutation batches
    pub api_mutation_endpoint: String,
    /// Page size for pulls
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Lower values sync first
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Stored columns; the first one holds the id
    pub columns: Vec<String>,
    /// Field in remote items carrying the entity id
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

fn default_batch_size() -> usize {
    100
}

fn default_priority() -> i32 {
    100
}

fn default_id_field() -> String {
    "id".to_string()
}

impl SyncEntityConfig {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table_name: name.to_string(),
            api_endpoint: format!("/{}", name),
            api_mutation_endpoint: format!("/{}/mutations", name),
            batch_size: default_batch_size(),
            priority: default_priority(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            id_field: default_id_field(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Table and column names end up in SQL text, so only plain identifiers pass
    pub fn validate(&self) -> SyncResult<()> {
        if self.name.is_empty() {
            return Err(SyncError::InvalidConfig("entity name is empty".into()));
        }
        if !is_identifier(&self.table_name) {
            return Err(SyncError::InvalidConfig(format!(
                "invalid table name for {}: {:?}",
                self.name, self.table_name
            )));
        }
        if self.columns.is_empty() {
            return Err(SyncError::InvalidConfig(format!(
                "entity {} declares no columns",
                self.name
            )));
        }
        if let Some(bad) = self.columns.iter().find(|c| !is_identifier(c)) {
            return Err(SyncError::InvalidConfig(format!(
                "invalid column name for {}: {:?}",
                self.name, bad
            )));
        }
        if self.batch_size == 0 {
            return Err(SyncError::InvalidConfig(format!(
                "batch_size for {} must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Shared entity table, read by the sync engine and the push cycle
#[derive(Debug, Clone, Default)]
pub struct EntityRegistry {
    entities: Arc<RwLock<HashMap<String, SyncEntityConfig>>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-registering a name replaces the previous config
    pub fn register(&self, config: SyncEntityConfig) -> SyncResult<()> {
        config.validate()?;
        let previous = self.entities.write().insert(config.name.clone(), config);
        if let Some(previous) = previous {
            tracing::debug!(entity = %previous.name, "Replaced entity registration");
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> SyncResult<SyncEntityConfig> {
        self.entities
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownEntity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.read().contains_key(name)
    }

    /// All entities, lowest priority value first, ties broken by name
    pub fn by_priority(&self) -> Vec<SyncEntityConfig> {
        let mut configs: Vec<SyncEntityConfig> = self.entities.read().values().cloned().collect();
        configs.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        configs
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }
}
