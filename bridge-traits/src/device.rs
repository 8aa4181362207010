//! Device Conditions
//!
//! Connectivity, battery and storage state used to decide whether queued
//! background work may start.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// Connected to network
    Connected,
    /// Not connected to any network
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Snapshot of the conditions relevant to work constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConditions {
    pub network: NetworkStatus,
    pub battery_low: bool,
    pub storage_low: bool,
}

impl DeviceConditions {
    /// Connected, battery and storage healthy.
    pub fn healthy() -> Self {
        Self {
            network: NetworkStatus::Connected,
            battery_low: false,
            storage_low: false,
        }
    }
}

/// Device monitor trait
///
/// Lets the scheduler defer periodic syncs while offline or when the device
/// is short on battery or storage.
///
/// # Platform Support
///
/// - **Desktop**: TCP reachability probe, battery and storage assumed healthy
/// - **Android**: ConnectivityManager, BatteryManager, StorageManager
///
/// # Example
///
/// ```ignore
/// use bridge_traits::device::DeviceMonitor;
///
/// async fn should_sync(monitor: &dyn DeviceMonitor) -> bool {
///     monitor.is_connected().await
/// }
/// ```
#[async_trait::async_trait]
pub trait DeviceMonitor: Send + Sync {
    /// Get current device conditions
    async fn conditions(&self) -> Result<DeviceConditions>;

    /// Check if currently connected to any network
    async fn is_connected(&self) -> bool {
        matches!(
            self.conditions().await,
            Ok(DeviceConditions {
                network: NetworkStatus::Connected,
                ..
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Offline;

    #[async_trait::async_trait]
    impl DeviceMonitor for Offline {
        async fn conditions(&self) -> Result<DeviceConditions> {
            Ok(DeviceConditions {
                network: NetworkStatus::Disconnected,
                ..DeviceConditions::healthy()
            })
        }
    }

    #[tokio::test]
    async fn test_is_connected_default() {
        assert!(!Offline.is_connected().await);
    }
}
