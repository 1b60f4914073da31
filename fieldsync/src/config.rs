//! Runtime flags for the sync subsystem
//!
//! Every optimization can be switched off at runtime so the naive
//! (non-chunked, non-coalesced) behavior stays available for A/B comparison.
//! Settings load from YAML and are then overridden by environment variables
//! named after the flags (`FAST_PUSH_DEBOUNCE_MS`, `CHUNK_SIZE`, ...).

use crate::error::{SyncError, SyncResult};
use crate::local_db::LocalDbConfig;
use crate::registry::SyncEntityConfig;
use crate::remote_api::ApiConfig;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Settings shared by every component of one sync context; edits apply to
/// the next cycle
pub type SharedSettings = Arc<RwLock<SyncSettings>>;

/// Tunables for fast push, full-sync throttling, chunked writes and triggers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Quiet period after the last mutation before a push fires
    #[serde(with = "duration_millis")]
    pub fast_push_debounce: Duration,
    /// Minimum interval between full-sync completions
    #[serde(with = "duration_millis")]
    pub full_sync_throttle: Duration,
    /// Schedule a full sync after each successful push
    pub fast_push_schedule_full_sync: bool,
    /// Defer scheduled full syncs while on a non-wifi connection
    pub full_sync_prefer_wifi: bool,
    /// Buffered mutation count that forces an immediate push
    pub fast_push_max_buffer_size: usize,
    /// Rows per chunked write
    pub chunk_size: usize,
    /// Pause between chunks; zero means a bare scheduler yield
    #[serde(with = "duration_millis")]
    pub chunk_yield_delay: Duration,
    /// Split large writes into chunks
    pub chunk_processing: bool,
    /// Debounced push-only cycles instead of push + full sync per mutation
    pub fast_push_only: bool,
    /// Delay between scheduling a full sync and running it
    #[serde(with = "duration_millis")]
    pub full_sync_schedule_delay: Duration,
    /// Quiet period per dedup key for push-notification triggers
    #[serde(with = "duration_millis")]
    pub trigger_debounce: Duration,
    /// Rejection window after a triggered sync completes
    #[serde(with = "duration_millis")]
    pub trigger_cooldown: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            fast_push_debounce: Duration::from_millis(100),
            full_sync_throttle: Duration::from_millis(30_000),
            fast_push_schedule_full_sync: true,
            full_sync_prefer_wifi: false,
            fast_push_max_buffer_size: 10,
            chunk_size: 50,
            chunk_yield_delay: Duration::ZERO,
            chunk_processing: true,
            fast_push_only: true,
            full_sync_schedule_delay: Duration::ZERO,
            trigger_debounce: Duration::from_millis(500),
            trigger_cooldown: Duration::from_millis(2_000),
        }
    }
}

impl SyncSettings {
    /// Baseline without chunking or coalescing, for regression comparison
    pub fn naive() -> Self {
        Self {
            chunk_processing: false,
            fast_push_only: false,
            fast_push_schedule_full_sync: false,
            ..Self::default()
        }
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> SyncResult<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply any flag present in the environment on top of `self`
    pub fn with_env_overrides(mut self) -> SyncResult<Self> {
        if let Some(ms) = env_value::<u64>("FAST_PUSH_DEBOUNCE_MS")? {
            self.fast_push_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("FULL_SYNC_THROTTLE_MS")? {
            self.full_sync_throttle = Duration::from_millis(ms);
        }
        if let Some(flag) = env_flag("FAST_PUSH_SCHEDULE_FULL_SYNC")? {
            self.fast_push_schedule_full_sync = flag;
        }
        if let Some(flag) = env_flag("FULL_SYNC_PREFER_WIFI")? {
            self.full_sync_prefer_wifi = flag;
        }
        if let Some(size) = env_value::<usize>("FAST_PUSH_MAX_BUFFER_SIZE")? {
            self.fast_push_max_buffer_size = size;
        }
        if let Some(size) = env_value::<usize>("CHUNK_SIZE")? {
            self.chunk_size = size;
        }
        if let Some(ms) = env_value::<u64>("CHUNK_YIELD_DELAY_MS")? {
            self.chunk_yield_delay = Duration::from_millis(ms);
        }
        if let Some(flag) = env_flag("SYNC_OPT_CHUNK_PROCESSING")? {
            self.chunk_processing = flag;
        }
        if let Some(flag) = env_flag("SYNC_OPT_FAST_PUSH_ONLY")? {
            self.fast_push_only = flag;
        }
        if let Some(ms) = env_value::<u64>("FULL_SYNC_SCHEDULE_DELAY_MS")? {
            self.full_sync_schedule_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("TRIGGER_DEBOUNCE_MS")? {
            self.trigger_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64>("TRIGGER_COOLDOWN_MS")? {
            self.trigger_cooldown = Duration::from_millis(ms);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.chunk_size == 0 {
            return Err(SyncError::InvalidConfig("CHUNK_SIZE must be positive".into()));
        }
        if self.fast_push_max_buffer_size == 0 {
            return Err(SyncError::InvalidConfig(
                "FAST_PUSH_MAX_BUFFER_SIZE must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to stand up a sync context from one file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSyncConfig {
    pub database: LocalDbConfig,
    pub api: ApiConfig,
    pub sync: SyncSettings,
    pub entities: Vec<SyncEntityConfig>,
}

impl FieldSyncConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> SyncResult<Self> {
        let config: FieldSyncConfig = serde_yaml::from_str(contents)?;
        config.sync.validate()?;
        Ok(config)
    }

    /// Environment overrides for flags and API credentials
    pub fn with_env_overrides(mut self) -> SyncResult<Self> {
        self.sync = self.sync.with_env_overrides()?;
        if let Ok(url) = std::env::var("FIELDSYNC_API_URL") {
            self.api.base_url = url;
        }
        if let Ok(token) = std::env::var("FIELDSYNC_API_TOKEN") {
            self.api.auth_token = Some(token);
        }
        if let Ok(path) = std::env::var("FIELDSYNC_DB_PATH") {
            self.database.db_path = path;
        }
        Ok(self)
    }
}

fn env_value<T>(key: &str) -> SyncResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SyncError::InvalidConfig(format!("{}={}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> SyncResult<Option<bool>> {
    match std::env::var(key) {
        Ok(raw) => parse_flag(&raw)
            .map(Some)
            .ok_or_else(|| SyncError::InvalidConfig(format!("{}={} is not a boolean", key, raw))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// Serialize Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(crate::metrics::whole_millis(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SyncSettings::default();
        assert_eq!(settings.fast_push_debounce, Duration::from_millis(100));
        assert_eq!(settings.chunk_size, 50);
        assert!(settings.chunk_processing);
        assert!(settings.fast_push_only);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_naive_disables_optimizations() {
        let settings = SyncSettings::naive();
        assert!(!settings.chunk_processing);
        assert!(!settings.fast_push_only);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag(" off "), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn test_yaml_config_uses_millis_and_defaults() {
        let yaml = r#"
api:
  base_url: "https://api.example.test"
sync:
  fast_push_debounce: 250
  chunk_size: 20
entities:
  - name: clients
    table_name: clients
    api_endpoint: /clients
    api_mutation_endpoint: /clients/mutations
    columns: [id, name, active]
"#;
        let config = FieldSyncConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.sync.fast_push_debounce, Duration::from_millis(250));
        assert_eq!(config.sync.chunk_size, 20);
        assert_eq!(config.sync.full_sync_throttle, Duration::from_millis(30_000));
        assert_eq!(config.api.base_url, "https://api.example.test");
        assert_eq!(config.entities.len(), 1);
        assert_eq!(config.entities[0].batch_size, 100);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let yaml = "sync:\n  chunk_size: 0\n";
        let err = FieldSyncConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(_)));
    }
}
