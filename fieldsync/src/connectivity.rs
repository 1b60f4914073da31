//! Network status collaborator consulted before pushes and full syncs

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub is_connected: bool,
    /// e.g. "wifi", "cellular"; `None` when the platform does not say
    #[serde(rename = "type", default)]
    pub connection_type: Option<String>,
}

impl NetworkStatus {
    pub fn online(connection_type: Option<&str>) -> Self {
        Self {
            is_connected: true,
            connection_type: connection_type.map(str::to_string),
        }
    }

    pub fn offline() -> Self {
        Self {
            is_connected: false,
            connection_type: None,
        }
    }

    /// Unknown connection types count as wifi
    pub fn is_wifi(&self) -> bool {
        self.connection_type
            .as_deref()
            .map_or(true, |t| t.eq_ignore_ascii_case("wifi"))
    }
}

#[async_trait]
pub trait Connectivity: Send + Sync {
    async fn status(&self) -> NetworkStatus;
}

/// Status set by the host (platform callback, CLI flag, tests)
#[derive(Debug)]
pub struct ManualConnectivity {
    status: RwLock<NetworkStatus>,
}

impl ManualConnectivity {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status: RwLock::new(status),
        }
    }

    pub fn online() -> Self {
        Self::new(NetworkStatus::online(Some("wifi")))
    }

    pub fn set(&self, status: NetworkStatus) {
        *self.status.write() = status;
    }
}

impl Default for ManualConnectivity {
    fn default() -> Self {
        Self::online()
    }
}

#[async_trait]
impl Connectivity for ManualConnectivity {
    async fn status(&self) -> NetworkStatus {
        self.status.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_wifi() {
        assert!(NetworkStatus::online(Some("wifi")).is_wifi());
        assert!(NetworkStatus::online(None).is_wifi());
        assert!(!NetworkStatus::online(Some("cellular")).is_wifi());
    }

    #[tokio::test]
    async fn test_manual_connectivity_updates() {
        let connectivity = ManualConnectivity::online();
        assert!(connectivity.status().await.is_connected);
        connectivity.set(NetworkStatus::offline());
        assert!(!connectivity.status().await.is_connected);
    }

    #[test]
    fn test_deserialize_platform_shape() {
        let status: NetworkStatus =
            serde_json::from_str(r#"{"isConnected":true,"type":"cellular"}"#).unwrap();
        assert!(status.is_connected);
        assert_eq!(status.connection_type.as_deref(), Some("cellular"));
    }
}
