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

//! Connection lifecycle: scan, connect, discover, idle disconnect and
//! auto-reconnect.

use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::ble_constants::timing;
use super::radio::{CharacteristicKind, DeviceId, Radio, ScanFilter};
use super::timers::{TimerKind, TimerSet};
use crate::collaborators::DeviceRegistry;

/// State of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Discovering,
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Scanning => "Scanning...",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Discovering => "Discovering...",
            ConnectionState::Connected => "Connected",
        }
    }
}

/// The connected bottle. Only exists while `Connected`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHandle {
    pub id: DeviceId,
    pub name: Option<String>,
    pub characteristics: HashSet<CharacteristicKind>,
}

impl DeviceHandle {
    pub fn has(&self, kind: CharacteristicKind) -> bool {
        self.characteristics.contains(&kind)
    }
}

/// Timing and reconnect policy.
#[derive(Debug, Clone)]
pub struct ConnectionPolicy {
    pub filter: ScanFilter,
    pub scan_timeout: Duration,
    pub connection_timeout: Duration,
    pub idle_disconnect: Duration,
    pub auto_reconnect: bool,
    pub reconnect_grace: Duration,
    pub reconnect_scan: Duration,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            filter: ScanFilter::default(),
            scan_timeout: timing::SCAN_TIMEOUT,
            connection_timeout: timing::CONNECTION_TIMEOUT,
            idle_disconnect: timing::IDLE_DISCONNECT,
            auto_reconnect: true,
            reconnect_grace: timing::RECONNECT_GRACE,
            reconnect_scan: timing::RECONNECT_SCAN,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum ScanMode {
    /// User scan: first match wins.
    Manual,
    /// Reconnect burst: only the last known bottle is accepted.
    Reconnect(DeviceId),
}

const CONNECTION_TIMERS: [TimerKind; 4] = [
    TimerKind::Scan,
    TimerKind::Connection,
    TimerKind::IdleDisconnect,
    TimerKind::ReconnectGrace,
];

/// Owns `ConnectionState` and drives the radio through it.
pub struct ConnectionManager {
    state: ConnectionState,
    policy: ConnectionPolicy,
    registry: Box<dyn DeviceRegistry>,
    scan_mode: ScanMode,
    pending: Option<(DeviceId, Option<String>)>,
    device: Option<DeviceHandle>,
    background_target: Option<DeviceId>,
    idle_suspended: bool,
}

impl ConnectionManager {
    pub fn new(policy: ConnectionPolicy, registry: Box<dyn DeviceRegistry>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy,
            registry,
            scan_mode: ScanMode::Manual,
            pending: None,
            device: None,
            background_target: None,
            idle_suspended: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub fn has_characteristic(&self, kind: CharacteristicKind) -> bool {
        self.device.as_ref().map(|d| d.has(kind)).unwrap_or(false)
    }

    pub fn last_known(&self) -> Option<DeviceId> {
        self.registry.last_known()
    }

    /// Begin a manual scan.
    pub fn start_scan(&mut self, radio: &mut dyn Radio, timers: &mut TimerSet) {
        if self.state == ConnectionState::Scanning && !radio.is_scanning() {
            warn!("State says scanning but the radio is idle, resetting");
            self.reset(timers);
        }

        if self.state != ConnectionState::Disconnected {
            debug!("Ignoring scan request in state {:?}", self.state);
            return;
        }

        timers.cancel(TimerKind::ReconnectGrace);
        self.begin_scan(ScanMode::Manual, self.policy.scan_timeout, radio, timers);
    }

    fn begin_scan(
        &mut self,
        mode: ScanMode,
        timeout: Duration,
        radio: &mut dyn Radio,
        timers: &mut TimerSet,
    ) {
        if let Err(e) = radio.start_scan(&self.policy.filter) {
            error!("Failed to start scan: {}", e);
            self.reset(timers);
            return;
        }

        info!("Scanning for bottles ({:?})", mode);
        self.scan_mode = mode;
        self.state = ConnectionState::Scanning;
        timers.arm(TimerKind::Scan, timeout);
    }

    /// Connect to a specific bottle, abandoning any scan in progress.
    pub fn connect(&mut self, device: DeviceId, radio: &mut dyn Radio, timers: &mut TimerSet) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Scanning => {
                radio.stop_scan();
                timers.cancel(TimerKind::Scan);
            }
            state => {
                warn!("Ignoring connect to {} in state {:?}", device, state);
                return;
            }
        }
        timers.cancel(TimerKind::ReconnectGrace);
        self.begin_connect(device, None, radio, timers);
    }

    fn begin_connect(
        &mut self,
        device: DeviceId,
        name: Option<String>,
        radio: &mut dyn Radio,
        timers: &mut TimerSet,
    ) {
        info!("Connecting to {}", device);
        if let Err(e) = radio.connect(&device) {
            error!("Failed to start connection to {}: {}", device, e);
            self.reset(timers);
            return;
        }

        self.background_target = None;
        self.pending = Some((device, name));
        self.state = ConnectionState::Connecting;
        timers.arm(TimerKind::Connection, self.policy.connection_timeout);
    }

    pub fn on_advertisement(
        &mut self,
        device: DeviceId,
        name: Option<String>,
        radio: &mut dyn Radio,
        timers: &mut TimerSet,
    ) {
        match self.state {
            ConnectionState::Scanning => {}
            ConnectionState::Disconnected if self.background_target.as_ref() == Some(&device) => {
                info!("Background reconnect: {} is back in range", device);
                self.begin_connect(device, name, radio, timers);
                return;
            }
            _ => return,
        }

        if let ScanMode::Reconnect(target) = &self.scan_mode {
            if *target != device {
                debug!("Reconnect scan ignoring {}", device);
                return;
            }
        }

        info!(
            "Found bottle {} ({})",
            device,
            name.as_deref().unwrap_or("unnamed")
        );
        radio.stop_scan();
        timers.cancel(TimerKind::Scan);
        self.begin_connect(device, name, radio, timers);
    }

    pub fn on_connected(&mut self, device: DeviceId, radio: &mut dyn Radio, timers: &mut TimerSet) {
        let expected = self.pending.as_ref().map(|(id, _)| id);
        if self.state != ConnectionState::Connecting || expected != Some(&device) {
            warn!("Unexpected connect from {} in state {:?}", device, self.state);
            return;
        }

        if let Err(e) = self.registry.remember(&device) {
            warn!("Failed to persist last known device: {}", e);
        }

        self.state = ConnectionState::Discovering;
        if let Err(e) = radio.discover(&device) {
            error!("Failed to start discovery on {}: {}", device, e);
            radio.disconnect(&device);
            self.reset(timers);
        }
    }

    pub fn on_discovered(
        &mut self,
        device: DeviceId,
        characteristics: Vec<CharacteristicKind>,
        radio: &mut dyn Radio,
        timers: &mut TimerSet,
    ) {
        if self.state != ConnectionState::Discovering {
            warn!("Unexpected discovery result in state {:?}", self.state);
            return;
        }

        let found: HashSet<CharacteristicKind> = characteristics.into_iter().collect();
        let missing: Vec<_> = CharacteristicKind::MANDATORY
            .iter()
            .filter(|kind| !found.contains(kind))
            .collect();
        if !missing.is_empty() {
            warn!("Bottle {} is missing characteristics {:?}", device, missing);
            radio.disconnect(&device);
            self.reset(timers);
            return;
        }

        let name = self.pending.take().and_then(|(_, name)| name);
        timers.cancel(TimerKind::Connection);
        info!("Connected to {} ({} characteristics)", device, found.len());
        self.device = Some(DeviceHandle {
            id: device,
            name,
            characteristics: found,
        });
        self.state = ConnectionState::Connected;
        timers.arm(TimerKind::IdleDisconnect, self.policy.idle_disconnect);
    }

    pub fn on_connect_failed(&mut self, device: DeviceId, error: &str, timers: &mut TimerSet) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        warn!("Connection to {} failed: {}", device, error);
        self.reset(timers);
    }

    pub fn on_discovery_failed(
        &mut self,
        device: DeviceId,
        error: &str,
        radio: &mut dyn Radio,
        timers: &mut TimerSet,
    ) {
        if self.state != ConnectionState::Discovering {
            return;
        }
        warn!("Discovery on {} failed: {}", device, error);
        radio.disconnect(&device);
        self.reset(timers);
    }

    /// Link lost. Anything we did not ask for counts as unexpected.
    pub fn on_disconnected(&mut self, device: DeviceId, reason: &str, timers: &mut TimerSet) {
        let current = self
            .device
            .as_ref()
            .map(|d| &d.id)
            .or(self.pending.as_ref().map(|(id, _)| id));
        if current != Some(&device) {
            debug!("Ignoring disconnect from {}", device);
            return;
        }

        let was_connected = self.state == ConnectionState::Connected;
        warn!("Bottle {} disconnected: {}", device, reason);
        self.reset(timers);

        if was_connected && self.policy.auto_reconnect {
            info!(
                "Reconnecting to {} in {:?}",
                device, self.policy.reconnect_grace
            );
            timers.arm(TimerKind::ReconnectGrace, self.policy.reconnect_grace);
        }
    }

    /// Close the link on request.
    pub fn disconnect(
        &mut self,
        request_background_reconnect: bool,
        radio: &mut dyn Radio,
        timers: &mut TimerSet,
    ) {
        let target = self
            .device
            .as_ref()
            .map(|d| d.id.clone())
            .or(self.pending.as_ref().map(|(id, _)| id.clone()));

        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::Scanning => radio.stop_scan(),
            _ => {
                if let Some(id) = &target {
                    info!("Disconnecting from {}", id);
                    radio.disconnect(id);
                }
            }
        }
        self.reset(timers);

        if request_background_reconnect {
            let Some(id) = target.or_else(|| self.registry.last_known()) else {
                return;
            };
            match radio.request_background_reconnect(&id) {
                Ok(()) => self.background_target = Some(id),
                Err(e) => warn!("Background reconnect request failed: {}", e),
            }
        }
    }

    pub fn on_timer(&mut self, kind: TimerKind, radio: &mut dyn Radio, timers: &mut TimerSet) {
        match kind {
            TimerKind::Scan if self.state == ConnectionState::Scanning => {
                warn!("Scan timed out without a matching bottle");
                radio.stop_scan();
                self.reset(timers);
            }
            TimerKind::Connection
                if matches!(
                    self.state,
                    ConnectionState::Connecting | ConnectionState::Discovering
                ) =>
            {
                warn!(
                    "Connection timed out after {:?} in state {:?}",
                    self.policy.connection_timeout, self.state
                );
                if let Some((id, _)) = &self.pending {
                    radio.disconnect(id);
                }
                self.reset(timers);
            }
            TimerKind::ReconnectGrace if self.state == ConnectionState::Disconnected => {
                match self.registry.last_known() {
                    Some(id) => self.begin_scan(
                        ScanMode::Reconnect(id),
                        self.policy.reconnect_scan,
                        radio,
                        timers,
                    ),
                    None => debug!("No known bottle to reconnect to"),
                }
            }
            TimerKind::IdleDisconnect if self.state == ConnectionState::Connected => {
                info!(
                    "No activity for {:?}, releasing the bottle",
                    self.policy.idle_disconnect
                );
                self.disconnect(false, radio, timers);
            }
            _ => debug!("Ignoring {:?} timer in state {:?}", kind, self.state),
        }
    }

    /// Restart the idle window after user activity.
    pub fn touch(&mut self, timers: &mut TimerSet) {
        if self.state == ConnectionState::Connected && !self.idle_suspended {
            timers.arm(TimerKind::IdleDisconnect, self.policy.idle_disconnect);
        }
    }

    /// Hold the link open, e.g. for the duration of a calibration.
    /// Activity does not re-arm the timer until [`Self::resume_idle`].
    pub fn suspend_idle(&mut self, timers: &mut TimerSet) {
        self.idle_suspended = true;
        timers.cancel(TimerKind::IdleDisconnect);
    }

    pub fn resume_idle(&mut self, timers: &mut TimerSet) {
        self.idle_suspended = false;
        self.touch(timers);
    }

    fn reset(&mut self, timers: &mut TimerSet) {
        self.state = ConnectionState::Disconnected;
        self.scan_mode = ScanMode::Manual;
        self.pending = None;
        self.device = None;
        self.idle_suspended = false;
        timers.cancel_all(&CONNECTION_TIMERS);
    }
}
