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

//! Messages flowing into and out of the engine.

use serde::Serialize;
use tokio::sync::oneshot;

use crate::bluetooth::protocol::{
    ActivitySummary, BackpackSession, BottleConfig, CurrentState, DeviceCommand, DeviceSettings,
    MotionWakeEvent,
};
use crate::bluetooth::timers::TimerKind;
use crate::bluetooth::{CharacteristicKind, ConnectionState, DeviceId};
use crate::calibration::CalibrationPhase;

/// Everything the engine reacts to, in arrival order.
#[derive(Debug)]
pub enum EngineEvent {
    /// Radio callback.
    Link(LinkEvent),
    /// A timer armed by the engine expired.
    Timer { kind: TimerKind, token: u64 },
    /// Application request.
    Request(EngineRequest),
}

/// Radio callbacks, one variant per delegate event.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A device matching the scan filter advertised.
    Advertisement {
        device: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// Link established.
    Connected { device: DeviceId },
    /// Link establishment failed.
    ConnectFailed { device: DeviceId, error: String },
    /// Characteristic discovery finished; lists what was found and subscribed.
    Discovered {
        device: DeviceId,
        characteristics: Vec<CharacteristicKind>,
    },
    /// Characteristic discovery failed.
    DiscoveryFailed { device: DeviceId, error: String },
    /// Notification or read result.
    ValueUpdated {
        kind: CharacteristicKind,
        value: Vec<u8>,
    },
    /// A queued write failed.
    WriteFailed {
        kind: CharacteristicKind,
        error: String,
    },
    /// Link lost or closed.
    Disconnected { device: DeviceId, reason: String },
}

/// Requests issued through [`EngineHandle`](crate::engine::EngineHandle).
#[derive(Debug)]
pub enum EngineRequest {
    StartScan,
    Connect(DeviceId),
    Disconnect { request_background_reconnect: bool },
    RequestSync,
    DeleteRecord {
        record_id: u32,
        reply: oneshot::Sender<bool>,
    },
    StartCalibration,
    ConfirmCalibrationStep,
    CancelCalibration,
    SendCommand(DeviceCommand),
    WriteBottleConfig(BottleConfig),
    WriteSettings(DeviceSettings),
    FetchActivitySummary,
    FetchMotionEvents,
    FetchBackpackSessions,
    Shutdown,
}

/// Updates broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineUpdate {
    ConnectionChanged {
        state: ConnectionState,
    },
    DeviceFound {
        device: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    CurrentState {
        state: CurrentState,
    },
    BottleConfig {
        config: BottleConfig,
    },
    Settings {
        settings: DeviceSettings,
    },
    SyncProgress {
        progress: f32,
    },
    SyncCompleted {
        records: usize,
    },
    SyncFailed {
        reason: String,
    },
    DeleteFinished {
        record_id: u32,
        confirmed: bool,
    },
    Calibration {
        phase: CalibrationPhase,
    },
    CalibrationProgress {
        progress: f32,
    },
    ActivitySummary {
        summary: ActivitySummary,
    },
    MotionEvents {
        events: Vec<MotionWakeEvent>,
    },
    BackpackSessions {
        sessions: Vec<BackpackSession>,
    },
    DiagnosticsFailed {
        reason: String,
    },
    CommandFailed {
        command: String,
        error: String,
    },
}
