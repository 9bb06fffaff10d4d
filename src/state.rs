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

//! Application state management.
//!
//! The engine writes a snapshot after every event; the application reads it
//! whenever it needs the current picture without subscribing to updates.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::protocol::{BottleConfig, CurrentState, DeviceSettings};
use crate::bluetooth::{ConnectionState, DeviceId};
use crate::calibration::CalibrationPhase;
use crate::collaborators::HydrationSnapshot;
use crate::sync::SyncPhase;

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    /// Current link state.
    pub connection: RwLock<ConnectionState>,

    /// Connected bottle id and advertised name.
    pub device: RwLock<Option<(DeviceId, Option<String>)>>,

    /// Latest CurrentState, superseded wholesale on each notification.
    pub current: RwLock<Option<CurrentState>>,

    pub bottle_config: RwLock<Option<BottleConfig>>,

    pub settings: RwLock<Option<DeviceSettings>>,

    pub sync_phase: RwLock<SyncPhase>,

    pub sync_progress: RwLock<Option<f32>>,

    pub calibration: RwLock<CalibrationPhase>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            connection: RwLock::new(ConnectionState::Disconnected),
            device: RwLock::new(None),
            current: RwLock::new(None),
            bottle_config: RwLock::new(None),
            settings: RwLock::new(None),
            sync_phase: RwLock::new(SyncPhase::Idle),
            sync_progress: RwLock::new(None),
            calibration: RwLock::new(CalibrationPhase::NotStarted),
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_connection(&self, state: ConnectionState, device: Option<(DeviceId, Option<String>)>) {
        *self.connection.write() = state;
        *self.device.write() = device;
    }

    pub fn get_connection(&self) -> ConnectionState {
        *self.connection.read()
    }

    pub fn get_device(&self) -> Option<(DeviceId, Option<String>)> {
        self.device.read().clone()
    }

    pub fn set_current(&self, state: CurrentState) {
        *self.current.write() = Some(state);
    }

    pub fn get_current(&self) -> Option<CurrentState> {
        *self.current.read()
    }

    pub fn set_bottle_config(&self, config: BottleConfig) {
        *self.bottle_config.write() = Some(config);
    }

    pub fn get_bottle_config(&self) -> Option<BottleConfig> {
        *self.bottle_config.read()
    }

    pub fn set_settings(&self, settings: DeviceSettings) {
        *self.settings.write() = Some(settings);
    }

    pub fn get_settings(&self) -> Option<DeviceSettings> {
        *self.settings.read()
    }

    pub fn set_sync(&self, phase: SyncPhase, progress: Option<f32>) {
        *self.sync_phase.write() = phase;
        *self.sync_progress.write() = progress;
    }

    pub fn get_sync_phase(&self) -> SyncPhase {
        self.sync_phase.read().clone()
    }

    pub fn get_sync_progress(&self) -> Option<f32> {
        *self.sync_progress.read()
    }

    pub fn set_calibration(&self, phase: CalibrationPhase) {
        *self.calibration.write() = phase;
    }

    pub fn get_calibration(&self) -> CalibrationPhase {
        self.calibration.read().clone()
    }

    /// Daily figures for the companion device and reminders. Needs a
    /// CurrentState; the goal is zero until the bottle config was read.
    pub fn hydration_snapshot(&self) -> Option<HydrationSnapshot> {
        let current = self.get_current()?;
        let goal = self
            .get_bottle_config()
            .map(|config| config.daily_goal_ml)
            .unwrap_or(0);
        Some(HydrationSnapshot {
            timestamp_sec: current.timestamp_sec,
            daily_total_ml: current.daily_total_ml,
            daily_goal_ml: goal,
            bottle_level_ml: current.bottle_level_ml,
            battery_percent: current.battery_percent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::protocol::StateFlags;

    #[test]
    fn test_hydration_snapshot_needs_current_state() {
        let state = AppState::new();
        assert!(state.hydration_snapshot().is_none());

        state.set_current(CurrentState {
            timestamp_sec: 1_700_000_000,
            current_weight_g: 0,
            bottle_level_ml: 420,
            daily_total_ml: 900,
            battery_percent: 72,
            flags: StateFlags(StateFlags::TIME_VALID),
            unsynced_count: 0,
        });
        let snapshot = state.hydration_snapshot().unwrap();
        assert_eq!(snapshot.daily_total_ml, 900);
        assert_eq!(snapshot.daily_goal_ml, 0);

        state.set_bottle_config(BottleConfig {
            scale_factor: 4.2,
            tare_weight_grams: 180,
            capacity_ml: 830,
            daily_goal_ml: 2500,
        });
        assert_eq!(state.hydration_snapshot().unwrap().deficit_ml(), 1600);
    }

    #[test]
    fn test_defaults() {
        let state = AppState::new();
        assert_eq!(state.get_connection(), ConnectionState::Disconnected);
        assert_eq!(state.get_sync_phase(), SyncPhase::Idle);
        assert_eq!(state.get_calibration(), CalibrationPhase::NotStarted);
        assert!(state.get_device().is_none());
    }
}
