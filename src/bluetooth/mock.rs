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

//! Mock radio for testing.
//!
//! Records every operation so tests can assert on scans, connects and writes.
//! Results are never produced on its own; tests inject `LinkEvent`s.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::Arc;

use super::radio::{CharacteristicKind, DeviceId, Radio, ScanFilter};

/// Operation issued to the mock radio.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioOp {
    StartScan(ScanFilter),
    StopScan,
    Connect(DeviceId),
    Discover(DeviceId),
    Write(CharacteristicKind, Vec<u8>),
    Read(CharacteristicKind),
    Disconnect(DeviceId),
    BackgroundReconnect(DeviceId),
}

#[derive(Debug, Default)]
struct MockRadioInner {
    ops: Vec<RadioOp>,
    scanning: bool,
    fail_next_write: Option<String>,
}

/// Cloneable handle; clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MockRadio {
    inner: Arc<Mutex<MockRadioInner>>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// All operations so far, oldest first.
    pub fn ops(&self) -> Vec<RadioOp> {
        self.inner.lock().ops.clone()
    }

    /// Payloads written to `kind`, oldest first.
    pub fn writes_to(&self, kind: CharacteristicKind) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .ops
            .iter()
            .filter_map(|op| match op {
                RadioOp::Write(k, data) if *k == kind => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.inner.lock().ops.clear();
    }

    /// Pretend the radio stopped scanning behind our back.
    pub fn set_scanning(&self, scanning: bool) {
        self.inner.lock().scanning = scanning;
    }

    /// Cause the next write() to fail with the given error.
    pub fn fail_next_write(&self, error: &str) {
        self.inner.lock().fail_next_write = Some(error.to_string());
    }

    fn record(&self, op: RadioOp) {
        self.inner.lock().ops.push(op);
    }
}

impl Radio for MockRadio {
    fn start_scan(&mut self, filter: &ScanFilter) -> Result<()> {
        self.inner.lock().scanning = true;
        self.record(RadioOp::StartScan(filter.clone()));
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.inner.lock().scanning = false;
        self.record(RadioOp::StopScan);
    }

    fn is_scanning(&self) -> bool {
        self.inner.lock().scanning
    }

    fn connect(&mut self, device: &DeviceId) -> Result<()> {
        self.record(RadioOp::Connect(device.clone()));
        Ok(())
    }

    fn discover(&mut self, device: &DeviceId) -> Result<()> {
        self.record(RadioOp::Discover(device.clone()));
        Ok(())
    }

    fn write(&mut self, kind: CharacteristicKind, data: Vec<u8>) -> Result<()> {
        if let Some(error) = self.inner.lock().fail_next_write.take() {
            return Err(anyhow!(error));
        }
        self.record(RadioOp::Write(kind, data));
        Ok(())
    }

    fn read(&mut self, kind: CharacteristicKind) -> Result<()> {
        self.record(RadioOp::Read(kind));
        Ok(())
    }

    fn disconnect(&mut self, device: &DeviceId) {
        self.record(RadioOp::Disconnect(device.clone()));
    }

    fn request_background_reconnect(&mut self, device: &DeviceId) -> Result<()> {
        self.record(RadioOp::BackgroundReconnect(device.clone()));
        Ok(())
    }
}
