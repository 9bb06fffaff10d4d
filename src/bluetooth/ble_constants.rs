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

//! BLE service and characteristic UUIDs for the bottle firmware.

use uuid::Uuid;

/// Bottle GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6f75_0000_b5a3_f393_e0a9_e50e24dcca9e);

/// Current state characteristic UUID.
/// Properties: Read, Notify
pub const CURRENT_STATE_UUID: Uuid = Uuid::from_u128(0x6f75_0001_b5a3_f393_e0a9_e50e24dcca9e);

/// Bottle config characteristic UUID.
/// Properties: Read, Write
pub const BOTTLE_CONFIG_UUID: Uuid = Uuid::from_u128(0x6f75_0002_b5a3_f393_e0a9_e50e24dcca9e);

/// Sync control characteristic UUID.
/// Properties: Read, Write, Notify
pub const SYNC_CONTROL_UUID: Uuid = Uuid::from_u128(0x6f75_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// Drink data (bulk transfer) characteristic UUID.
/// Properties: Notify
pub const DRINK_DATA_UUID: Uuid = Uuid::from_u128(0x6f75_0004_b5a3_f393_e0a9_e50e24dcca9e);

/// Command characteristic UUID.
/// Properties: Write
pub const COMMAND_UUID: Uuid = Uuid::from_u128(0x6f75_0005_b5a3_f393_e0a9_e50e24dcca9e);

/// Device settings characteristic UUID.
/// Properties: Read, Write
pub const DEVICE_SETTINGS_UUID: Uuid = Uuid::from_u128(0x6f75_0006_b5a3_f393_e0a9_e50e24dcca9e);

/// Calibration state characteristic UUID (optional on older firmware).
/// Properties: Read, Notify
pub const CALIBRATION_STATE_UUID: Uuid =
    Uuid::from_u128(0x6f75_0007_b5a3_f393_e0a9_e50e24dcca9e);

/// Activity stats characteristic UUID (optional on older firmware).
/// Properties: Read, Notify
pub const ACTIVITY_STATS_UUID: Uuid = Uuid::from_u128(0x6f75_0008_b5a3_f393_e0a9_e50e24dcca9e);

/// Advertised name prefix of bottle firmware.
pub const DEFAULT_NAME_PREFIX: &str = "Aquavate";

/// Protocol timing.
pub mod timing {
    use std::time::Duration;

    /// No matching advertisement within this window ends the scan.
    pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);

    /// Link establishment plus discovery must finish within this window.
    pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

    /// Inactivity window after which a connected bottle is released.
    pub const IDLE_DISCONNECT: Duration = Duration::from_secs(60);

    /// Pause between an unexpected disconnect and the reconnect scan burst.
    pub const RECONNECT_GRACE: Duration = Duration::from_millis(1500);

    /// Length of the reconnect scan burst.
    pub const RECONNECT_SCAN: Duration = Duration::from_secs(10);

    /// Maximum gap between chunks of an active sync.
    pub const SYNC_INACTIVITY: Duration = Duration::from_secs(10);

    /// Wait for the CurrentState that confirms a delete.
    pub const DELETE_CONFIRMATION: Duration = Duration::from_secs(5);

    /// Hard limit on a single calibration measurement.
    pub const CALIBRATION_MEASUREMENT: Duration = Duration::from_secs(30);

    /// Device-side persistence window after calibration data is written.
    pub const CALIBRATION_SAVE_GRACE: Duration = Duration::from_secs(1);

    /// Progress estimate refresh interval while measuring.
    pub const CALIBRATION_PROGRESS_TICK: Duration = Duration::from_millis(500);

    /// Per-chunk wait for diagnostics fetches.
    pub const DIAGNOSTICS_FETCH: Duration = Duration::from_secs(5);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SERVICE_UUID.to_string().to_lowercase(),
            "6f750000-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            DRINK_DATA_UUID.to_string().to_lowercase(),
            "6f750004-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_characteristic_uuids_are_distinct() {
        let all = [
            CURRENT_STATE_UUID,
            BOTTLE_CONFIG_UUID,
            SYNC_CONTROL_UUID,
            DRINK_DATA_UUID,
            COMMAND_UUID,
            DEVICE_SETTINGS_UUID,
            CALIBRATION_STATE_UUID,
            ACTIVITY_STATS_UUID,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
