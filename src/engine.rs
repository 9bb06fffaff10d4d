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

//! Single-threaded protocol engine.
//!
//! Radio callbacks, timer expiries and application requests all arrive on one
//! queue and are handled in order. No protocol state is shared with other
//! tasks; the application sees updates through a broadcast channel and a
//! state snapshot.

use anyhow::{anyhow, Result};
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::bluetooth::ble_constants::timing;
use crate::bluetooth::protocol::{
    BottleConfig, CalibrationState, CurrentState, DeviceCommand, DeviceSettings, DrinkDataChunk,
    DrinkRecord, SyncControl, WireRecord,
};
use crate::bluetooth::timers::{TimerKind, TimerSet};
use crate::bluetooth::{
    CharacteristicKind, ConnectionManager, ConnectionPolicy, ConnectionState, DeviceId, Radio,
};
use crate::calibration::{CalibrationAction, CalibrationFailure, CalibrationMachine, CalibrationPhase};
use crate::collaborators::{Collaborators, CompanionSync, HealthMirror, Storage};
use crate::commands::{self, CommandError};
use crate::events::{EngineEvent, EngineRequest, EngineUpdate, LinkEvent};
use crate::state::AppState;
use crate::sync::{
    ChunkOutcome, ControlOutcome, DeleteTracker, DiagnosticsFetcher, DiagnosticsKind,
    DiagnosticsOutcome, PendingDelete, SyncEngine, SyncFailure, SyncPhase,
};

/// Queue depth for engine events.
pub const EVENT_QUEUE_SIZE: usize = 64;

/// Buffered updates per subscriber.
const UPDATE_BUFFER_SIZE: usize = 128;

const CALIBRATION_TIMERS: [TimerKind; 3] = [
    TimerKind::CalibrationMeasurement,
    TimerKind::CalibrationProgress,
    TimerKind::CalibrationSave,
];

/// Create the engine queue. The sender goes to the radio backend.
pub fn event_channel() -> (mpsc::Sender<EngineEvent>, mpsc::Receiver<EngineEvent>) {
    mpsc::channel(EVENT_QUEUE_SIZE)
}

/// Runtime tuning of the engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub connection: ConnectionPolicy,
    /// Start a sync whenever the bottle reports unsynced records.
    pub auto_sync: bool,
    pub sync_inactivity: Duration,
    pub delete_confirmation: Duration,
    pub calibration_measurement: Duration,
    pub calibration_save_grace: Duration,
    pub calibration_progress_tick: Duration,
    pub diagnostics_fetch: Duration,
    /// Capacity used for calibration before the bottle config was read.
    pub default_capacity_ml: u16,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            connection: ConnectionPolicy::default(),
            auto_sync: true,
            sync_inactivity: timing::SYNC_INACTIVITY,
            delete_confirmation: timing::DELETE_CONFIRMATION,
            calibration_measurement: timing::CALIBRATION_MEASUREMENT,
            calibration_save_grace: timing::CALIBRATION_SAVE_GRACE,
            calibration_progress_tick: timing::CALIBRATION_PROGRESS_TICK,
            diagnostics_fetch: timing::DIAGNOSTICS_FETCH,
            default_capacity_ml: 830,
        }
    }
}

/// Application-side handle. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    events: mpsc::Sender<EngineEvent>,
    updates: broadcast::Sender<EngineUpdate>,
    state: Arc<AppState>,
}

impl EngineHandle {
    async fn request(&self, request: EngineRequest) -> Result<()> {
        self.events
            .send(EngineEvent::Request(request))
            .await
            .map_err(|_| anyhow!("engine has stopped"))
    }

    pub async fn start_scan(&self) -> Result<()> {
        self.request(EngineRequest::StartScan).await
    }

    pub async fn connect(&self, device: DeviceId) -> Result<()> {
        self.request(EngineRequest::Connect(device)).await
    }

    pub async fn disconnect(&self, request_background_reconnect: bool) -> Result<()> {
        self.request(EngineRequest::Disconnect {
            request_background_reconnect,
        })
        .await
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.get_connection()
    }

    /// Shared snapshot of everything the engine knows.
    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.updates.subscribe()
    }

    pub async fn request_sync(&self) -> Result<()> {
        self.request(EngineRequest::RequestSync).await
    }

    /// Delete a drink record on the bottle. Resolves to `true` only once the
    /// bottle confirmed; the local copy is removed in that case alone.
    pub async fn delete_record(&self, record_id: u32) -> bool {
        let (reply, confirmation) = oneshot::channel();
        if self
            .request(EngineRequest::DeleteRecord { record_id, reply })
            .await
            .is_err()
        {
            return false;
        }
        confirmation.await.unwrap_or(false)
    }

    pub async fn start_calibration(&self) -> Result<()> {
        self.request(EngineRequest::StartCalibration).await
    }

    pub async fn confirm_calibration_step(&self) -> Result<()> {
        self.request(EngineRequest::ConfirmCalibrationStep).await
    }

    pub async fn cancel_calibration(&self) -> Result<()> {
        self.request(EngineRequest::CancelCalibration).await
    }

    pub async fn send_command(&self, command: DeviceCommand) -> Result<()> {
        self.request(EngineRequest::SendCommand(command)).await
    }

    pub async fn write_bottle_config(&self, config: BottleConfig) -> Result<()> {
        self.request(EngineRequest::WriteBottleConfig(config)).await
    }

    pub async fn write_settings(&self, settings: DeviceSettings) -> Result<()> {
        self.request(EngineRequest::WriteSettings(settings)).await
    }

    pub async fn fetch_activity_summary(&self) -> Result<()> {
        self.request(EngineRequest::FetchActivitySummary).await
    }

    pub async fn fetch_motion_events(&self) -> Result<()> {
        self.request(EngineRequest::FetchMotionEvents).await
    }

    pub async fn fetch_backpack_sessions(&self) -> Result<()> {
        self.request(EngineRequest::FetchBackpackSessions).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(EngineRequest::Shutdown).await
    }
}

/// The protocol core.
pub struct Engine {
    radio: Box<dyn Radio>,
    events: mpsc::Receiver<EngineEvent>,
    timers: TimerSet,
    connection: ConnectionManager,
    sync: SyncEngine,
    deletes: DeleteTracker,
    diagnostics: DiagnosticsFetcher,
    calibration: CalibrationMachine,
    storage: Box<dyn Storage>,
    health: Box<dyn HealthMirror>,
    companion: Box<dyn CompanionSync>,
    settings: EngineSettings,
    state: Arc<AppState>,
    updates: broadcast::Sender<EngineUpdate>,
    bottle_config: Option<BottleConfig>,
    last_unsynced: u16,
}

impl Engine {
    /// Build the engine around a radio that reports into `event_tx`.
    pub fn new(
        radio: Box<dyn Radio>,
        collaborators: Collaborators,
        settings: EngineSettings,
        event_tx: mpsc::Sender<EngineEvent>,
        event_rx: mpsc::Receiver<EngineEvent>,
    ) -> (Self, EngineHandle) {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER_SIZE);
        let state = AppState::new();

        let handle = EngineHandle {
            events: event_tx.clone(),
            updates: updates.clone(),
            state: state.clone(),
        };

        let engine = Self {
            radio,
            events: event_rx,
            timers: TimerSet::new(event_tx),
            connection: ConnectionManager::new(settings.connection.clone(), collaborators.registry),
            sync: SyncEngine::new(),
            deletes: DeleteTracker::new(),
            diagnostics: DiagnosticsFetcher::new(),
            calibration: CalibrationMachine::new(),
            storage: collaborators.storage,
            health: collaborators.health,
            companion: collaborators.companion,
            settings,
            state,
            updates,
            bottle_config: None,
            last_unsynced: 0,
        };
        (engine, handle)
    }

    /// Process events until shutdown or until every sender is gone.
    pub async fn run(mut self) {
        info!("Engine started");
        while self.step().await {}
        info!("Engine stopped");
    }

    /// Handle the next event. Returns `false` once the engine should stop.
    pub async fn step(&mut self) -> bool {
        match self.events.recv().await {
            Some(event) => self.handle_event(event),
            None => false,
        }
    }

    pub fn handle_event(&mut self, event: EngineEvent) -> bool {
        trace!("Event: {:?}", event);
        let before = self.connection.state();
        let calibration_before = self.calibration.phase().clone();

        let keep_running = match event {
            EngineEvent::Link(event) => {
                self.on_link_event(event);
                true
            }
            EngineEvent::Timer { kind, token } => {
                if self.timers.take_fired(kind, token) {
                    self.on_timer(kind);
                } else {
                    trace!("Stale {:?} timer", kind);
                }
                true
            }
            EngineEvent::Request(EngineRequest::Shutdown) => {
                self.shutdown();
                false
            }
            EngineEvent::Request(request) => {
                self.on_request(request);
                true
            }
        };

        self.after_event(before, calibration_before);
        keep_running
    }

    fn publish(&self, update: EngineUpdate) {
        debug!("Update: {:?}", update);
        // No subscribers is fine.
        let _ = self.updates.send(update);
    }

    fn device_id(&self) -> Option<DeviceId> {
        self.connection.device().map(|d| d.id.clone())
    }

    fn capacity_ml(&self) -> u16 {
        self.bottle_config
            .map(|config| config.capacity_ml)
            .filter(|capacity| *capacity > 0)
            .unwrap_or(self.settings.default_capacity_ml)
    }

    fn after_event(&mut self, before: ConnectionState, calibration_before: CalibrationPhase) {
        let after = self.connection.state();
        if before != after {
            info!("Connection: {} -> {}", before.as_str(), after.as_str());
            let device = self
                .connection
                .device()
                .map(|d| (d.id.clone(), d.name.clone()));
            self.state.set_connection(after, device);
            self.publish(EngineUpdate::ConnectionChanged { state: after });

            if after == ConnectionState::Connected {
                self.on_link_up();
            } else if before == ConnectionState::Connected {
                self.on_link_down();
            }
        }

        if *self.calibration.phase() != calibration_before {
            let phase = self.calibration.phase().clone();
            self.state.set_calibration(phase.clone());
            self.publish(EngineUpdate::Calibration { phase });
        }

        self.state.set_sync(self.sync.phase(), self.sync.progress());
    }

    fn on_link_up(&mut self) {
        self.sync.clear_failure();
        for kind in [
            CharacteristicKind::BottleConfig,
            CharacteristicKind::DeviceSettings,
            CharacteristicKind::CurrentState,
        ] {
            if let Err(e) = self.radio.read(kind) {
                warn!("Initial read of {:?} failed: {}", kind, e);
            }
        }

        let clock = commands::clock_sync(Utc::now());
        self.send_command(&clock);
    }

    /// Everything tied to the link fails with it.
    fn on_link_down(&mut self) {
        self.timers.cancel(TimerKind::SyncInactivity);
        if self.sync.fail(SyncFailure::Disconnected) {
            self.publish(EngineUpdate::SyncFailed {
                reason: SyncFailure::Disconnected.to_string(),
            });
        }

        if let Some(pending) = self.deletes.take() {
            self.timers.cancel(TimerKind::DeleteConfirmation);
            warn!("Delete of {} unconfirmed, bottle disconnected", pending.record_id);
            self.finish_delete(pending, false);
        }

        let actions = self.calibration.on_disconnect();
        self.apply_calibration(actions);

        if self.diagnostics.abort() {
            self.timers.cancel(TimerKind::DiagnosticsFetch);
            self.publish(EngineUpdate::DiagnosticsFailed {
                reason: "bottle disconnected".to_string(),
            });
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down engine");
        self.connection
            .disconnect(false, self.radio.as_mut(), &mut self.timers);
        self.radio.stop_scan();
    }

    // ---- link events ----

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Advertisement { device, name, rssi } => {
                self.publish(EngineUpdate::DeviceFound {
                    device: device.clone(),
                    name: name.clone(),
                    rssi,
                });
                self.connection
                    .on_advertisement(device, name, self.radio.as_mut(), &mut self.timers);
            }
            LinkEvent::Connected { device } => {
                self.connection
                    .on_connected(device, self.radio.as_mut(), &mut self.timers);
            }
            LinkEvent::ConnectFailed { device, error } => {
                self.connection
                    .on_connect_failed(device, &error, &mut self.timers);
            }
            LinkEvent::Discovered {
                device,
                characteristics,
            } => {
                self.connection.on_discovered(
                    device,
                    characteristics,
                    self.radio.as_mut(),
                    &mut self.timers,
                );
            }
            LinkEvent::DiscoveryFailed { device, error } => {
                self.connection.on_discovery_failed(
                    device,
                    &error,
                    self.radio.as_mut(),
                    &mut self.timers,
                );
            }
            LinkEvent::ValueUpdated { kind, value } => self.on_value(kind, &value),
            LinkEvent::WriteFailed { kind, error } => self.on_write_failed(kind, error),
            LinkEvent::Disconnected { device, reason } => {
                self.connection
                    .on_disconnected(device, &reason, &mut self.timers);
            }
        }
    }

    fn on_write_failed(&mut self, kind: CharacteristicKind, error: String) {
        warn!("Write to {:?} failed: {}", kind, error);
        match kind {
            CharacteristicKind::SyncControl => {
                self.timers.cancel(TimerKind::SyncInactivity);
                let failure = SyncFailure::WriteFailed(error);
                if self.sync.fail(failure.clone()) {
                    self.publish(EngineUpdate::SyncFailed {
                        reason: failure.to_string(),
                    });
                }
            }
            CharacteristicKind::Command if self.calibration.is_active() => {
                let actions = self.calibration.on_command_failed(&error);
                self.publish(EngineUpdate::CommandFailed {
                    command: format!("{:?}", kind),
                    error,
                });
                self.apply_calibration(actions);
            }
            _ => self.publish(EngineUpdate::CommandFailed {
                command: format!("{:?}", kind),
                error,
            }),
        }
    }

    fn on_value(&mut self, kind: CharacteristicKind, value: &[u8]) {
        match kind {
            CharacteristicKind::CurrentState => match CurrentState::decode(value) {
                Ok(state) => self.on_current_state(state),
                Err(e) => warn!("Discarding notification: {}", e),
            },
            CharacteristicKind::BottleConfig => match BottleConfig::decode(value) {
                Ok(config) => {
                    info!(
                        "Bottle config: {} ml capacity, {} ml goal",
                        config.capacity_ml, config.daily_goal_ml
                    );
                    self.bottle_config = Some(config);
                    self.state.set_bottle_config(config);
                    self.publish(EngineUpdate::BottleConfig { config });
                }
                Err(e) => warn!("Discarding notification: {}", e),
            },
            CharacteristicKind::DeviceSettings => match DeviceSettings::decode(value) {
                Ok(settings) => {
                    self.state.set_settings(settings);
                    self.publish(EngineUpdate::Settings { settings });
                }
                Err(e) => warn!("Discarding notification: {}", e),
            },
            CharacteristicKind::SyncControl => match SyncControl::decode(value) {
                Ok(control) => self.on_sync_control(control),
                Err(e) => warn!("Discarding notification: {}", e),
            },
            CharacteristicKind::DrinkData => self.on_drink_data(value),
            CharacteristicKind::CalibrationState => match CalibrationState::decode(value) {
                Ok(state) => {
                    let actions = self.calibration.on_device_state(&state);
                    self.apply_calibration(actions);
                }
                Err(e) => warn!("Discarding notification: {}", e),
            },
            CharacteristicKind::ActivityStats => {
                let outcome = self.diagnostics.on_value(value);
                self.on_diagnostics(outcome);
            }
            CharacteristicKind::Command => {
                debug!("Ignoring value on the command channel");
            }
        }
    }

    fn on_current_state(&mut self, state: CurrentState) {
        // Any CurrentState after a delete confirms it.
        if let Some(pending) = self.deletes.take() {
            self.timers.cancel(TimerKind::DeleteConfirmation);
            self.complete_delete(pending);
        }

        if state.is_cal_result_ready() {
            let capacity = self.capacity_ml();
            let actions = self.calibration.on_current_state(&state, capacity);
            self.apply_calibration(actions);
            return;
        }

        self.last_unsynced = state.unsynced_count;
        self.state.set_current(state);
        self.publish(EngineUpdate::CurrentState { state });

        if let Some(snapshot) = self.state.hydration_snapshot() {
            self.companion.push(&snapshot);
        }

        if state.unsynced_count > 0 && self.settings.auto_sync {
            if matches!(self.sync.phase(), SyncPhase::Failed(_)) {
                debug!("Last sync failed, waiting for an explicit request");
            } else {
                self.start_sync(state.unsynced_count);
            }
        }
    }

    // ---- sync ----

    fn start_sync(&mut self, count: u16) {
        if !self.connection.is_connected() {
            warn!("Cannot sync, no bottle connected");
            return;
        }
        if self.calibration.is_active() {
            debug!("Sync deferred while calibrating");
            return;
        }
        let Some(start) = self.sync.start(count) else {
            return;
        };

        if let Err(e) = self
            .radio
            .write(CharacteristicKind::SyncControl, start.encode())
        {
            let failure = SyncFailure::WriteFailed(e.to_string());
            self.sync.fail(failure.clone());
            self.publish(EngineUpdate::SyncFailed {
                reason: failure.to_string(),
            });
            return;
        }

        self.timers
            .arm(TimerKind::SyncInactivity, self.settings.sync_inactivity);
        self.connection.touch(&mut self.timers);
        self.publish(EngineUpdate::SyncProgress { progress: 0.0 });
    }

    fn on_drink_data(&mut self, value: &[u8]) {
        let chunk = match DrinkDataChunk::decode(value) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Malformed drink data: {}", e);
                if self.sync.is_active() {
                    self.timers.cancel(TimerKind::SyncInactivity);
                    let failure = SyncFailure::Malformed(e.to_string());
                    self.sync.fail(failure.clone());
                    self.publish(EngineUpdate::SyncFailed {
                        reason: failure.to_string(),
                    });
                }
                return;
            }
        };

        match self.sync.on_chunk(chunk) {
            ChunkOutcome::Ignored => {}
            ChunkOutcome::Accepted { ack, progress } => {
                self.write_ack(ack);
                if self.sync.is_active() {
                    self.timers
                        .arm(TimerKind::SyncInactivity, self.settings.sync_inactivity);
                    self.connection.touch(&mut self.timers);
                    self.publish(EngineUpdate::SyncProgress { progress });
                }
            }
            ChunkOutcome::Completed { ack, records } => {
                self.write_ack(ack);
                self.finish_sync(records);
            }
        }
    }

    fn write_ack(&mut self, ack: SyncControl) {
        if let Err(e) = self.radio.write(CharacteristicKind::SyncControl, ack.encode()) {
            self.on_write_failed(CharacteristicKind::SyncControl, e.to_string());
        }
    }

    fn on_sync_control(&mut self, control: SyncControl) {
        match self.sync.on_control(control) {
            ControlOutcome::Nothing => {
                if self.sync.is_active() {
                    self.timers
                        .arm(TimerKind::SyncInactivity, self.settings.sync_inactivity);
                }
            }
            ControlOutcome::Completed(records) => self.finish_sync(records),
            ControlOutcome::Failed(failure) => {
                self.timers.cancel(TimerKind::SyncInactivity);
                self.publish(EngineUpdate::SyncFailed {
                    reason: failure.to_string(),
                });
            }
        }
    }

    /// Hand a completed transfer to storage and the health mirror.
    fn finish_sync(&mut self, records: Vec<DrinkRecord>) {
        self.timers.cancel(TimerKind::SyncInactivity);
        self.connection.touch(&mut self.timers);

        let count = records.len();
        let device = self
            .device_id()
            .unwrap_or_else(|| DeviceId::new("unknown"));
        if let Err(e) = self.storage.persist(&records, &device) {
            warn!("Failed to store {} synced records: {}", count, e);
        }

        if self.health.is_enabled() && self.health.is_authorized() {
            self.mirror_to_health();
        }

        self.publish(EngineUpdate::SyncCompleted { records: count });
    }

    fn mirror_to_health(&mut self) {
        let pending = match self.storage.unsynced_records() {
            Ok(records) => records,
            Err(e) => {
                warn!("Cannot list records for the health mirror: {}", e);
                return;
            }
        };

        for record in &pending {
            let Some(at) = Utc
                .timestamp_opt(i64::from(record.timestamp_sec), 0)
                .single()
            else {
                continue;
            };
            let amount = record.amount_ml.unsigned_abs();
            match self.health.log_sample(amount, at) {
                Ok(external_id) => {
                    if let Err(e) = self.storage.link_health_sample(record.record_id, &external_id) {
                        warn!("Failed to link health sample for {}: {}", record.record_id, e);
                    }
                }
                Err(e) => warn!("Health mirror rejected record {}: {}", record.record_id, e),
            }
        }
    }

    // ---- delete ----

    fn begin_delete(&mut self, record_id: u32, reply: oneshot::Sender<bool>) {
        if !self.connection.is_connected() {
            warn!("Cannot delete {}, no bottle connected", record_id);
            let _ = reply.send(false);
            return;
        }
        let Some(command) = self.deletes.begin(record_id, reply) else {
            return;
        };

        self.connection.touch(&mut self.timers);
        if self.send_command(&command).is_err() {
            if let Some(pending) = self.deletes.take() {
                self.finish_delete(pending, false);
            }
            return;
        }
        self.timers
            .arm(TimerKind::DeleteConfirmation, self.settings.delete_confirmation);
    }

    fn complete_delete(&mut self, pending: PendingDelete) {
        let record_id = pending.record_id;
        info!("Bottle confirmed delete of record {}", record_id);

        match self.storage.lookup_record_id(record_id) {
            Ok(Some(local_id)) => match self.storage.delete_record(local_id) {
                Ok(Some(external_id)) if self.health.is_enabled() => {
                    if let Err(e) = self.health.delete_sample(&external_id) {
                        warn!("Failed to delete health sample {}: {}", external_id, e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to delete local record {}: {}", record_id, e),
            },
            Ok(None) => debug!("Record {} was not stored locally", record_id),
            Err(e) => warn!("Lookup of record {} failed: {}", record_id, e),
        }

        self.finish_delete(pending, true);
    }

    fn finish_delete(&self, pending: PendingDelete, confirmed: bool) {
        let record_id = pending.record_id;
        pending.resolve(confirmed);
        self.publish(EngineUpdate::DeleteFinished {
            record_id,
            confirmed,
        });
    }

    // ---- calibration ----

    fn apply_calibration(&mut self, actions: Vec<CalibrationAction>) {
        for action in actions {
            match action {
                CalibrationAction::Send(command) => {
                    if let Err(e) = self.send_command(&command) {
                        let fallout = self.calibration.on_command_failed(&e.to_string());
                        if !fallout.is_empty() {
                            // The remaining actions assumed the write landed
                            self.apply_calibration(fallout);
                            return;
                        }
                    }
                }
                CalibrationAction::StartMeasurementTimers => {
                    self.timers.arm(
                        TimerKind::CalibrationMeasurement,
                        self.settings.calibration_measurement,
                    );
                    self.timers.arm(
                        TimerKind::CalibrationProgress,
                        self.settings.calibration_progress_tick,
                    );
                }
                CalibrationAction::StartSaveGrace => {
                    self.timers
                        .arm(TimerKind::CalibrationSave, self.settings.calibration_save_grace);
                }
                CalibrationAction::StopTimers => self.timers.cancel_all(&CALIBRATION_TIMERS),
                CalibrationAction::SuspendIdle => self.connection.suspend_idle(&mut self.timers),
                CalibrationAction::ResumeIdle => self.connection.resume_idle(&mut self.timers),
            }
        }
    }

    // ---- diagnostics ----

    fn begin_diagnostics(&mut self, kind: DiagnosticsKind) {
        if !self.connection.has_characteristic(CharacteristicKind::ActivityStats) {
            warn!("Bottle has no activity stats channel");
            self.publish(EngineUpdate::DiagnosticsFailed {
                reason: "activity stats not available".to_string(),
            });
            return;
        }
        let Some(command) = self.diagnostics.begin(kind) else {
            return;
        };
        self.connection.touch(&mut self.timers);
        self.request_diagnostics(command);
    }

    fn request_diagnostics(&mut self, command: DeviceCommand) {
        if let Err(e) = self.send_command(&command) {
            self.diagnostics.abort();
            self.timers.cancel(TimerKind::DiagnosticsFetch);
            self.publish(EngineUpdate::DiagnosticsFailed {
                reason: e.to_string(),
            });
            return;
        }
        self.timers
            .arm(TimerKind::DiagnosticsFetch, self.settings.diagnostics_fetch);
    }

    fn on_diagnostics(&mut self, outcome: DiagnosticsOutcome) {
        let update = match outcome {
            DiagnosticsOutcome::Nothing => return,
            DiagnosticsOutcome::Request(command) => {
                self.request_diagnostics(command);
                return;
            }
            DiagnosticsOutcome::Summary(summary) => EngineUpdate::ActivitySummary { summary },
            DiagnosticsOutcome::MotionEvents(events) => EngineUpdate::MotionEvents { events },
            DiagnosticsOutcome::BackpackSessions(sessions) => {
                EngineUpdate::BackpackSessions { sessions }
            }
            DiagnosticsOutcome::Failed(reason) => EngineUpdate::DiagnosticsFailed { reason },
        };
        self.timers.cancel(TimerKind::DiagnosticsFetch);
        self.publish(update);
    }

    // ---- commands ----

    fn send_command(&mut self, command: &DeviceCommand) -> Result<(), CommandError> {
        let result = commands::dispatch(command, self.connection.device(), self.radio.as_mut());
        if let Err(e) = &result {
            self.publish(EngineUpdate::CommandFailed {
                command: command.name().to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    fn write_and_refresh(&mut self, kind: CharacteristicKind, payload: Vec<u8>) {
        if !self.connection.is_connected() {
            warn!("Cannot write {:?}, no bottle connected", kind);
            self.publish(EngineUpdate::CommandFailed {
                command: format!("{:?}", kind),
                error: CommandError::NotConnected.to_string(),
            });
            return;
        }
        self.connection.touch(&mut self.timers);

        let result = self
            .radio
            .write(kind, payload)
            .and_then(|()| self.radio.read(kind));
        if let Err(e) = result {
            self.on_write_failed(kind, e.to_string());
        }
    }

    // ---- requests and timers ----

    fn on_request(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::StartScan => {
                self.connection
                    .start_scan(self.radio.as_mut(), &mut self.timers);
            }
            EngineRequest::Connect(device) => {
                self.connection
                    .connect(device, self.radio.as_mut(), &mut self.timers);
            }
            EngineRequest::Disconnect {
                request_background_reconnect,
            } => {
                self.connection.disconnect(
                    request_background_reconnect,
                    self.radio.as_mut(),
                    &mut self.timers,
                );
            }
            EngineRequest::RequestSync => {
                self.connection.touch(&mut self.timers);
                self.start_sync(self.last_unsynced);
            }
            EngineRequest::DeleteRecord { record_id, reply } => {
                self.begin_delete(record_id, reply);
            }
            EngineRequest::StartCalibration => {
                if !self.connection.is_connected() {
                    warn!("Cannot calibrate, no bottle connected");
                    self.publish(EngineUpdate::Calibration {
                        phase: CalibrationPhase::Failed(CalibrationFailure::NotConnected),
                    });
                    return;
                }
                let actions = self.calibration.start();
                self.apply_calibration(actions);
            }
            EngineRequest::ConfirmCalibrationStep => {
                let actions = self.calibration.confirm();
                self.apply_calibration(actions);
            }
            EngineRequest::CancelCalibration => {
                let actions = self.calibration.cancel();
                self.apply_calibration(actions);
            }
            EngineRequest::SendCommand(command) => {
                self.connection.touch(&mut self.timers);
                let _ = self.send_command(&command);
            }
            EngineRequest::WriteBottleConfig(config) => {
                self.write_and_refresh(CharacteristicKind::BottleConfig, config.encode());
            }
            EngineRequest::WriteSettings(settings) => {
                self.write_and_refresh(CharacteristicKind::DeviceSettings, settings.encode());
            }
            EngineRequest::FetchActivitySummary => self.begin_diagnostics(DiagnosticsKind::Summary),
            EngineRequest::FetchMotionEvents => {
                self.begin_diagnostics(DiagnosticsKind::MotionEvents)
            }
            EngineRequest::FetchBackpackSessions => {
                self.begin_diagnostics(DiagnosticsKind::BackpackSessions)
            }
            EngineRequest::Shutdown => self.shutdown(),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Scan
            | TimerKind::Connection
            | TimerKind::ReconnectGrace
            | TimerKind::IdleDisconnect => {
                self.connection
                    .on_timer(kind, self.radio.as_mut(), &mut self.timers);
            }
            TimerKind::SyncInactivity => {
                if self.sync.fail(SyncFailure::Timeout) {
                    self.publish(EngineUpdate::SyncFailed {
                        reason: SyncFailure::Timeout.to_string(),
                    });
                }
            }
            TimerKind::DeleteConfirmation => {
                if let Some(pending) = self.deletes.take() {
                    warn!(
                        "No confirmation for delete of {} within {:?}, keeping local copy",
                        pending.record_id, self.settings.delete_confirmation
                    );
                    self.finish_delete(pending, false);
                }
            }
            TimerKind::CalibrationMeasurement => {
                let actions = self.calibration.on_measurement_timeout();
                self.apply_calibration(actions);
            }
            TimerKind::CalibrationProgress => {
                if let Some(progress) = self.calibration.progress() {
                    self.publish(EngineUpdate::CalibrationProgress { progress });
                    self.timers.arm(
                        TimerKind::CalibrationProgress,
                        self.settings.calibration_progress_tick,
                    );
                }
            }
            TimerKind::CalibrationSave => {
                let actions = self.calibration.on_save_grace_elapsed();
                self.apply_calibration(actions);
            }
            TimerKind::DiagnosticsFetch => {
                if self.diagnostics.abort() {
                    warn!("Activity stats fetch timed out");
                    self.publish(EngineUpdate::DiagnosticsFailed {
                        reason: "timed out".to_string(),
                    });
                }
            }
        }
    }
}
