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

//! Two-point scale calibration.
//!
//! The user empties the bottle, confirms, and the bottle captures a stable raw
//! ADC reading (~10 s). Then the same with a full bottle. The reading comes
//! back through the CurrentState side-channel (cal-result-ready flag). The
//! scale factor is `(full - empty) / capacity`.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bluetooth::protocol::{CalibrationPoint, CalibrationState, CurrentState, DeviceCommand};

/// Ceiling of the local progress estimate until the real result arrives.
const PROGRESS_CEILING: f32 = 0.95;

/// Time constant of the progress estimate.
const PROGRESS_TIME_CONSTANT_SECS: f32 = 4.0;

/// Why a calibration ended early.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum CalibrationFailure {
    #[error("measurement timed out")]
    Timeout,
    #[error("full reading {full_adc} is not above empty reading {empty_adc}")]
    InvalidMeasurement { empty_adc: i32, full_adc: i32 },
    #[error("bottle capacity is unknown")]
    InvalidCapacity,
    #[error("bottle reported a calibration error")]
    DeviceError,
    #[error("bottle disconnected")]
    Disconnected,
    #[error("not connected to a bottle")]
    NotConnected,
    #[error("command to the bottle failed: {0}")]
    WriteFailed(String),
}

/// Calibration workflow states.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CalibrationPhase {
    NotStarted,
    EmptyPrompt,
    MeasuringEmpty,
    EmptyMeasured(i32),
    FullPrompt,
    MeasuringFull,
    FullMeasured(i32),
    SavingCalibration,
    Complete(f32),
    Failed(CalibrationFailure),
}

impl CalibrationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Failed(_))
    }

    pub fn is_measuring(&self) -> bool {
        matches!(self, Self::MeasuringEmpty | Self::MeasuringFull)
    }
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationAction {
    Send(DeviceCommand),
    /// Arm the measurement timeout and progress ticker.
    StartMeasurementTimers,
    /// Arm the post-write persistence grace period.
    StartSaveGrace,
    /// Cancel every calibration timer.
    StopTimers,
    /// Keep the link open while calibrating.
    SuspendIdle,
    /// Restart the idle-disconnect window.
    ResumeIdle,
}

/// Scale factor in ADC units per millilitre.
pub fn compute_scale_factor(
    empty_adc: i32,
    full_adc: i32,
    capacity_ml: u16,
) -> Result<f32, CalibrationFailure> {
    if full_adc <= empty_adc {
        return Err(CalibrationFailure::InvalidMeasurement {
            empty_adc,
            full_adc,
        });
    }
    if capacity_ml == 0 {
        return Err(CalibrationFailure::InvalidCapacity);
    }
    let span = i64::from(full_adc) - i64::from(empty_adc);
    Ok(span as f32 / f32::from(capacity_ml))
}

/// Progress estimate for an ongoing measurement. Approaches the ceiling
/// asymptotically and carries no protocol meaning.
pub fn estimated_progress(elapsed: Duration) -> f32 {
    let t = elapsed.as_secs_f32() / PROGRESS_TIME_CONSTANT_SECS;
    PROGRESS_CEILING * (1.0 - (-t).exp())
}

/// Calibration session state.
pub struct CalibrationMachine {
    phase: CalibrationPhase,
    empty_adc: Option<i32>,
    full_adc: Option<i32>,
    scale_factor: Option<f32>,
    measuring_since: Option<Instant>,
}

impl CalibrationMachine {
    pub fn new() -> Self {
        Self {
            phase: CalibrationPhase::NotStarted,
            empty_adc: None,
            full_adc: None,
            scale_factor: None,
            measuring_since: None,
        }
    }

    pub fn phase(&self) -> &CalibrationPhase {
        &self.phase
    }

    /// Whether a calibration is underway (started and not finished).
    pub fn is_active(&self) -> bool {
        !matches!(self.phase, CalibrationPhase::NotStarted) && !self.phase.is_terminal()
    }

    pub fn progress(&self) -> Option<f32> {
        self.measuring_since
            .filter(|_| self.phase.is_measuring())
            .map(|since| estimated_progress(since.elapsed()))
    }

    pub fn start(&mut self) -> Vec<CalibrationAction> {
        if self.is_active() {
            debug!("Calibration already running in {:?}", self.phase);
            return vec![];
        }

        info!("Calibration started");
        self.reset();
        self.phase = CalibrationPhase::EmptyPrompt;
        vec![
            CalibrationAction::SuspendIdle,
            CalibrationAction::Send(DeviceCommand::StartCalibration),
        ]
    }

    /// The user confirmed the current prompt.
    pub fn confirm(&mut self) -> Vec<CalibrationAction> {
        match self.phase {
            CalibrationPhase::EmptyPrompt => self.begin_measuring(CalibrationPoint::Empty),
            CalibrationPhase::EmptyMeasured(_) => {
                self.phase = CalibrationPhase::FullPrompt;
                vec![]
            }
            CalibrationPhase::FullPrompt => self.begin_measuring(CalibrationPoint::Full),
            _ => {
                debug!("Nothing to confirm in {:?}", self.phase);
                vec![]
            }
        }
    }

    fn begin_measuring(&mut self, point: CalibrationPoint) -> Vec<CalibrationAction> {
        info!("Measuring {:?} point", point);
        self.phase = match point {
            CalibrationPoint::Empty => CalibrationPhase::MeasuringEmpty,
            CalibrationPoint::Full => CalibrationPhase::MeasuringFull,
        };
        self.measuring_since = Some(Instant::now());
        vec![
            CalibrationAction::Send(DeviceCommand::MeasureCalibrationPoint(point)),
            CalibrationAction::StartMeasurementTimers,
        ]
    }

    /// Feed a CurrentState notification; picks up the piggy-backed ADC value.
    pub fn on_current_state(
        &mut self,
        state: &CurrentState,
        capacity_ml: u16,
    ) -> Vec<CalibrationAction> {
        let Some(adc) = state.calibration_adc() else {
            return vec![];
        };

        match self.phase {
            CalibrationPhase::MeasuringEmpty => {
                info!("Empty reading: {}", adc);
                self.empty_adc = Some(adc);
                self.measuring_since = None;
                self.phase = CalibrationPhase::EmptyMeasured(adc);
                vec![CalibrationAction::StopTimers]
            }
            CalibrationPhase::MeasuringFull => {
                info!("Full reading: {}", adc);
                self.full_adc = Some(adc);
                self.measuring_since = None;
                self.phase = CalibrationPhase::FullMeasured(adc);
                self.finish_measurements(capacity_ml)
            }
            _ => {
                debug!("Calibration reading {} outside a measurement", adc);
                vec![]
            }
        }
    }

    fn finish_measurements(&mut self, capacity_ml: u16) -> Vec<CalibrationAction> {
        let (Some(empty_adc), Some(full_adc)) = (self.empty_adc, self.full_adc) else {
            return self.fail(CalibrationFailure::InvalidMeasurement {
                empty_adc: self.empty_adc.unwrap_or_default(),
                full_adc: self.full_adc.unwrap_or_default(),
            });
        };

        match compute_scale_factor(empty_adc, full_adc, capacity_ml) {
            Ok(scale_factor) => {
                info!(
                    "Scale factor {:.4} (empty {}, full {}, {} ml)",
                    scale_factor, empty_adc, full_adc, capacity_ml
                );
                self.scale_factor = Some(scale_factor);
                self.phase = CalibrationPhase::SavingCalibration;
                vec![
                    CalibrationAction::StopTimers,
                    CalibrationAction::Send(DeviceCommand::SetCalibrationData {
                        empty_adc,
                        full_adc,
                        scale_factor,
                    }),
                    CalibrationAction::StartSaveGrace,
                ]
            }
            Err(failure) => self.fail(failure),
        }
    }

    /// The device-side persistence window passed.
    pub fn on_save_grace_elapsed(&mut self) -> Vec<CalibrationAction> {
        if self.phase != CalibrationPhase::SavingCalibration {
            return vec![];
        }
        let Some(scale_factor) = self.scale_factor else {
            return vec![];
        };
        info!("Calibration complete");
        self.phase = CalibrationPhase::Complete(scale_factor);
        vec![CalibrationAction::ResumeIdle]
    }

    /// Feed the optional CalibrationState characteristic.
    pub fn on_device_state(&mut self, state: &CalibrationState) -> Vec<CalibrationAction> {
        if state.has_error() && self.is_active() {
            warn!("Bottle flagged a calibration error (state {})", state.state);
            return self.fail(CalibrationFailure::DeviceError);
        }
        vec![]
    }

    pub fn on_measurement_timeout(&mut self) -> Vec<CalibrationAction> {
        if !self.phase.is_measuring() {
            return vec![];
        }
        warn!("Calibration measurement timed out in {:?}", self.phase);
        self.fail(CalibrationFailure::Timeout)
    }

    /// A command to the bottle could not be written. Without it the device
    /// side of the workflow never advances.
    pub fn on_command_failed(&mut self, reason: &str) -> Vec<CalibrationAction> {
        if !self.is_active() {
            return vec![];
        }
        self.fail(CalibrationFailure::WriteFailed(reason.to_string()))
    }

    pub fn on_disconnect(&mut self) -> Vec<CalibrationAction> {
        if !self.is_active() {
            return vec![];
        }
        self.fail(CalibrationFailure::Disconnected)
    }

    /// Abandon calibration and return to `NotStarted`.
    pub fn cancel(&mut self) -> Vec<CalibrationAction> {
        let was_active = self.is_active();
        info!("Calibration cancelled in {:?}", self.phase);
        self.reset();

        let mut actions = vec![CalibrationAction::StopTimers];
        if was_active {
            actions.push(CalibrationAction::Send(DeviceCommand::CancelCalibration));
        }
        actions.push(CalibrationAction::ResumeIdle);
        actions
    }

    fn fail(&mut self, failure: CalibrationFailure) -> Vec<CalibrationAction> {
        warn!("Calibration failed: {}", failure);
        self.measuring_since = None;
        self.phase = CalibrationPhase::Failed(failure);
        vec![CalibrationAction::StopTimers, CalibrationAction::ResumeIdle]
    }

    fn reset(&mut self) {
        self.phase = CalibrationPhase::NotStarted;
        self.empty_adc = None;
        self.full_adc = None;
        self.scale_factor = None;
        self.measuring_since = None;
    }
}

impl Default for CalibrationMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::protocol::StateFlags;

    fn adc_state(adc: i32) -> CurrentState {
        let raw = adc as u32;
        CurrentState {
            timestamp_sec: 0,
            current_weight_g: (raw & 0xFFFF) as u16 as i16,
            bottle_level_ml: (raw >> 16) as u16,
            daily_total_ml: 0,
            battery_percent: 90,
            flags: StateFlags(StateFlags::CAL_RESULT_READY),
            unsynced_count: 0,
        }
    }

    fn plain_state() -> CurrentState {
        CurrentState {
            flags: StateFlags(StateFlags::STABLE),
            ..adc_state(0)
        }
    }

    fn run_to_full_measurement(machine: &mut CalibrationMachine, empty: i32) {
        machine.start();
        machine.confirm();
        machine.on_current_state(&adc_state(empty), 800);
        machine.confirm();
        machine.confirm();
        assert_eq!(machine.phase(), &CalibrationPhase::MeasuringFull);
    }

    #[test]
    fn test_scale_factor() {
        assert_eq!(compute_scale_factor(1000, 5000, 800), Ok(5.0));
        assert_eq!(
            compute_scale_factor(5000, 5000, 800),
            Err(CalibrationFailure::InvalidMeasurement {
                empty_adc: 5000,
                full_adc: 5000
            })
        );
        assert!(matches!(
            compute_scale_factor(5000, 1000, 800),
            Err(CalibrationFailure::InvalidMeasurement { .. })
        ));
        assert_eq!(
            compute_scale_factor(1000, 5000, 0),
            Err(CalibrationFailure::InvalidCapacity)
        );
        // No overflow on extreme readings
        assert!(compute_scale_factor(i32::MIN, i32::MAX, 1).is_ok());
    }

    #[test]
    fn test_happy_path() {
        let mut machine = CalibrationMachine::new();

        assert_eq!(
            machine.start(),
            vec![
                CalibrationAction::SuspendIdle,
                CalibrationAction::Send(DeviceCommand::StartCalibration)
            ]
        );
        assert_eq!(machine.phase(), &CalibrationPhase::EmptyPrompt);

        assert_eq!(
            machine.confirm(),
            vec![
                CalibrationAction::Send(DeviceCommand::MeasureCalibrationPoint(
                    CalibrationPoint::Empty
                )),
                CalibrationAction::StartMeasurementTimers,
            ]
        );
        assert_eq!(machine.phase(), &CalibrationPhase::MeasuringEmpty);

        // Ordinary notifications do not advance the measurement
        assert!(machine.on_current_state(&plain_state(), 800).is_empty());
        assert_eq!(machine.phase(), &CalibrationPhase::MeasuringEmpty);

        machine.on_current_state(&adc_state(1000), 800);
        assert_eq!(machine.phase(), &CalibrationPhase::EmptyMeasured(1000));

        machine.confirm();
        assert_eq!(machine.phase(), &CalibrationPhase::FullPrompt);
        machine.confirm();
        assert_eq!(machine.phase(), &CalibrationPhase::MeasuringFull);

        let actions = machine.on_current_state(&adc_state(5000), 800);
        assert!(actions.contains(&CalibrationAction::Send(
            DeviceCommand::SetCalibrationData {
                empty_adc: 1000,
                full_adc: 5000,
                scale_factor: 5.0,
            }
        )));
        assert!(actions.contains(&CalibrationAction::StartSaveGrace));
        assert_eq!(machine.phase(), &CalibrationPhase::SavingCalibration);

        assert_eq!(
            machine.on_save_grace_elapsed(),
            vec![CalibrationAction::ResumeIdle]
        );
        assert_eq!(machine.phase(), &CalibrationPhase::Complete(5.0));
        assert!(!machine.is_active());
    }

    #[test]
    fn test_full_not_above_empty_fails() {
        let mut machine = CalibrationMachine::new();
        run_to_full_measurement(&mut machine, 5000);

        let actions = machine.on_current_state(&adc_state(4000), 800);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, CalibrationAction::Send(_))));
        assert_eq!(
            machine.phase(),
            &CalibrationPhase::Failed(CalibrationFailure::InvalidMeasurement {
                empty_adc: 5000,
                full_adc: 4000
            })
        );
    }

    #[test]
    fn test_measurement_timeout() {
        let mut machine = CalibrationMachine::new();
        machine.start();
        assert!(machine.on_measurement_timeout().is_empty());

        machine.confirm();
        let actions = machine.on_measurement_timeout();
        assert!(actions.contains(&CalibrationAction::ResumeIdle));
        assert_eq!(
            machine.phase(),
            &CalibrationPhase::Failed(CalibrationFailure::Timeout)
        );
    }

    #[test]
    fn test_disconnect_fails_active_calibration() {
        let mut machine = CalibrationMachine::new();
        assert!(machine.on_disconnect().is_empty());

        machine.start();
        machine.on_disconnect();
        assert_eq!(
            machine.phase(),
            &CalibrationPhase::Failed(CalibrationFailure::Disconnected)
        );
    }

    #[test]
    fn test_failed_command_write_stops_session() {
        let mut machine = CalibrationMachine::new();
        assert!(machine.on_command_failed("gatt error").is_empty());

        run_to_full_measurement(&mut machine, 1000);
        let actions = machine.on_command_failed("gatt error");
        assert_eq!(
            actions,
            vec![CalibrationAction::StopTimers, CalibrationAction::ResumeIdle]
        );
        assert_eq!(
            machine.phase(),
            &CalibrationPhase::Failed(CalibrationFailure::WriteFailed("gatt error".into()))
        );

        // Terminal sessions ignore late failures
        assert!(machine.on_command_failed("again").is_empty());
    }

    #[test]
    fn test_device_error_flag() {
        let mut machine = CalibrationMachine::new();
        machine.start();
        machine.confirm();

        let ok = CalibrationState {
            state: 1,
            flags: 0,
            empty_adc: 0,
            full_adc: 0,
        };
        assert!(machine.on_device_state(&ok).is_empty());

        let failed = CalibrationState {
            flags: CalibrationState::ERROR,
            ..ok
        };
        machine.on_device_state(&failed);
        assert_eq!(
            machine.phase(),
            &CalibrationPhase::Failed(CalibrationFailure::DeviceError)
        );
    }

    #[test]
    fn test_cancel_returns_to_not_started() {
        let mut machine = CalibrationMachine::new();
        machine.start();
        machine.confirm();

        assert_eq!(
            machine.cancel(),
            vec![
                CalibrationAction::StopTimers,
                CalibrationAction::Send(DeviceCommand::CancelCalibration),
                CalibrationAction::ResumeIdle,
            ]
        );
        assert_eq!(machine.phase(), &CalibrationPhase::NotStarted);

        // Cancelling again is harmless and sends nothing to the bottle
        assert_eq!(
            machine.cancel(),
            vec![CalibrationAction::StopTimers, CalibrationAction::ResumeIdle]
        );
    }

    #[test]
    fn test_restart_after_failure() {
        let mut machine = CalibrationMachine::new();
        machine.start();
        machine.on_disconnect();
        assert!(!machine.start().is_empty());
        assert_eq!(machine.phase(), &CalibrationPhase::EmptyPrompt);
    }

    #[test]
    fn test_progress_estimate() {
        assert_eq!(estimated_progress(Duration::ZERO), 0.0);
        let at_ten = estimated_progress(Duration::from_secs(10));
        assert!(at_ten > 0.8 && at_ten < PROGRESS_CEILING);
        let late = estimated_progress(Duration::from_secs(600));
        assert!(late <= PROGRESS_CEILING);
        assert!(late > 0.94);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_only_while_measuring() {
        let mut machine = CalibrationMachine::new();
        machine.start();
        assert_eq!(machine.progress(), None);

        machine.confirm();
        tokio::time::advance(Duration::from_secs(5)).await;
        let progress = machine.progress().unwrap();
        assert!(progress > 0.5 && progress < PROGRESS_CEILING);

        machine.on_current_state(&adc_state(1000), 800);
        assert_eq!(machine.progress(), None);
    }
}
