// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Radio abstraction consumed by the engine.
//!
//! Every method only starts an operation. Results arrive later as
//! [`LinkEvent`](crate::events::LinkEvent)s on the engine queue, so the core
//! never blocks on the radio.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::ble_constants::*;

/// Stable identifier of a bottle (the BLE address on Linux).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Characteristics of the bottle service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CharacteristicKind {
    CurrentState,
    BottleConfig,
    SyncControl,
    DrinkData,
    Command,
    DeviceSettings,
    CalibrationState,
    ActivityStats,
}

impl CharacteristicKind {
    /// Channels without which the link is unusable.
    pub const MANDATORY: [CharacteristicKind; 6] = [
        Self::CurrentState,
        Self::BottleConfig,
        Self::SyncControl,
        Self::DrinkData,
        Self::Command,
        Self::DeviceSettings,
    ];

    pub const ALL: [CharacteristicKind; 8] = [
        Self::CurrentState,
        Self::BottleConfig,
        Self::SyncControl,
        Self::DrinkData,
        Self::Command,
        Self::DeviceSettings,
        Self::CalibrationState,
        Self::ActivityStats,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::CurrentState => CURRENT_STATE_UUID,
            Self::BottleConfig => BOTTLE_CONFIG_UUID,
            Self::SyncControl => SYNC_CONTROL_UUID,
            Self::DrinkData => DRINK_DATA_UUID,
            Self::Command => COMMAND_UUID,
            Self::DeviceSettings => DEVICE_SETTINGS_UUID,
            Self::CalibrationState => CALIBRATION_STATE_UUID,
            Self::ActivityStats => ACTIVITY_STATS_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.uuid() == uuid)
    }

    /// Whether the characteristic pushes notifications we subscribe to.
    pub fn notifies(&self) -> bool {
        matches!(
            self,
            Self::CurrentState
                | Self::SyncControl
                | Self::DrinkData
                | Self::CalibrationState
                | Self::ActivityStats
        )
    }
}

/// Advertisement filter for discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub name_prefix: Option<String>,
    pub service: Option<Uuid>,
}

impl ScanFilter {
    /// Check an advertisement against the filter. Either criterion matching is
    /// enough; an empty filter matches everything.
    pub fn matches(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        if self.name_prefix.is_none() && self.service.is_none() {
            return true;
        }
        let by_name = match (&self.name_prefix, name) {
            (Some(prefix), Some(name)) => name.starts_with(prefix.as_str()),
            _ => false,
        };
        let by_service = self
            .service
            .map(|uuid| services.contains(&uuid))
            .unwrap_or(false);
        by_name || by_service
    }
}

impl Default for ScanFilter {
    fn default() -> Self {
        Self {
            name_prefix: Some(DEFAULT_NAME_PREFIX.to_string()),
            service: Some(SERVICE_UUID),
        }
    }
}

/// Radio primitives used by the connection lifecycle manager.
pub trait Radio: Send {
    /// Begin discovery. Matches are reported as `LinkEvent::Advertisement`.
    fn start_scan(&mut self, filter: &ScanFilter) -> Result<()>;

    /// Stop discovery. Stopping an idle scanner is a no-op.
    fn stop_scan(&mut self);

    /// Whether the underlying radio is actually scanning.
    fn is_scanning(&self) -> bool;

    /// Establish the link. Reports `Connected` or `ConnectFailed`.
    fn connect(&mut self, device: &DeviceId) -> Result<()>;

    /// Locate characteristics and subscribe to notifying ones.
    /// Reports `Discovered` with the kinds found, or `DiscoveryFailed`.
    fn discover(&mut self, device: &DeviceId) -> Result<()>;

    /// Queue a write. Writes are issued one at a time in order; a failure is
    /// reported as `WriteFailed`.
    fn write(&mut self, kind: CharacteristicKind, data: Vec<u8>) -> Result<()>;

    /// Read a characteristic. The value arrives as `ValueUpdated`.
    fn read(&mut self, kind: CharacteristicKind) -> Result<()>;

    /// Tear down the link and drop cached characteristic handles.
    fn disconnect(&mut self, device: &DeviceId);

    /// Ask the platform to reconnect opportunistically when the device
    /// shows up again, instead of polling.
    fn request_background_reconnect(&mut self, device: &DeviceId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_lookup() {
        for kind in CharacteristicKind::ALL {
            assert_eq!(CharacteristicKind::from_uuid(kind.uuid()), Some(kind));
        }
        assert_eq!(CharacteristicKind::from_uuid(SERVICE_UUID), None);
    }

    #[test]
    fn test_scan_filter_matching() {
        let filter = ScanFilter::default();
        assert!(filter.matches(Some("Aquavate-1A2B"), &[]));
        assert!(filter.matches(None, &[SERVICE_UUID]));
        assert!(!filter.matches(Some("Speaker"), &[]));
        assert!(!filter.matches(None, &[]));

        let open = ScanFilter {
            name_prefix: None,
            service: None,
        };
        assert!(open.matches(None, &[]));
    }
}
