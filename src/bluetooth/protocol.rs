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

//! Binary wire protocol shared with the bottle firmware.
//!
//! Every characteristic carries a packed little-endian structure. Fixed-size
//! structures must match their declared size exactly; chunked structures carry
//! a 6-byte header followed by `recordCount` fixed-size records. Decoders never
//! return a partially populated value.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of records the firmware packs into one chunk.
pub const MAX_RECORDS_PER_CHUNK: usize = 20;

/// Size of the chunk header shared by drink and activity transfers.
pub const CHUNK_HEADER_SIZE: usize = 6;

/// Errors produced when a payload does not match its byte contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("{structure}: expected {expected} bytes, got {actual}")]
    Length {
        structure: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{structure}: {actual} bytes is shorter than the {header}-byte header")]
    Truncated {
        structure: &'static str,
        header: usize,
        actual: usize,
    },
    #[error("{structure}: {declared} records need {needed} bytes, only {available} available")]
    Overrun {
        structure: &'static str,
        declared: usize,
        needed: usize,
        available: usize,
    },
    #[error("{structure}: {declared} records exceeds the per-chunk limit of {limit}")]
    TooManyRecords {
        structure: &'static str,
        declared: usize,
        limit: usize,
    },
}

/// Sequential little-endian reader over a length-checked buffer.
///
/// Fields are copied out byte-wise, so packed payloads at any offset are fine.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    pub fn u16(&mut self) -> u16 {
        u16::from_le_bytes(self.take())
    }

    pub fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }

    pub fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    pub fn i32(&mut self) -> i32 {
        i32::from_le_bytes(self.take())
    }

    pub fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }

    pub fn skip(&mut self, n: usize) {
        self.pos += n;
    }
}

/// A fixed-size packed structure.
pub trait WireRecord: Sized {
    /// Name used in decode errors and logs.
    const NAME: &'static str;
    /// Exact encoded size in bytes.
    const SIZE: usize;

    /// Read the fields from a reader positioned at the start of the record.
    /// The caller guarantees `SIZE` bytes are available.
    fn read(r: &mut ByteReader<'_>) -> Self;

    /// Append the encoded fields to `out`.
    fn write(&self, out: &mut Vec<u8>);

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() != Self::SIZE {
            return Err(DecodeError::Length {
                structure: Self::NAME,
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        Ok(Self::read(&mut ByteReader::new(buf)))
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.write(&mut out);
        out
    }
}

/// CurrentState flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFlags(pub u8);

impl StateFlags {
    pub const TIME_VALID: u8 = 0x01;
    pub const CALIBRATED: u8 = 0x02;
    pub const STABLE: u8 = 0x04;
    pub const CAL_MEASURING: u8 = 0x08;
    pub const CAL_RESULT_READY: u8 = 0x10;

    fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }
}

/// Snapshot of the bottle, notified on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentState {
    pub timestamp_sec: u32,
    pub current_weight_g: i16,
    pub bottle_level_ml: u16,
    pub daily_total_ml: u16,
    pub battery_percent: u8,
    pub flags: StateFlags,
    pub unsynced_count: u16,
}

impl CurrentState {
    pub fn is_time_valid(&self) -> bool {
        self.flags.has(StateFlags::TIME_VALID)
    }

    pub fn is_calibrated(&self) -> bool {
        self.flags.has(StateFlags::CALIBRATED)
    }

    pub fn is_stable(&self) -> bool {
        self.flags.has(StateFlags::STABLE)
    }

    pub fn is_cal_measuring(&self) -> bool {
        self.flags.has(StateFlags::CAL_MEASURING)
    }

    pub fn is_cal_result_ready(&self) -> bool {
        self.flags.has(StateFlags::CAL_RESULT_READY)
    }

    /// Raw ADC reading piggy-backed on the weight and level fields.
    ///
    /// Only present while the cal-result-ready flag is set; weight and level
    /// are meaningless in that case.
    pub fn calibration_adc(&self) -> Option<i32> {
        if !self.is_cal_result_ready() {
            return None;
        }
        let low = self.current_weight_g as u16 as u32;
        let high = self.bottle_level_ml as u32;
        Some(((high << 16) | low) as i32)
    }
}

impl WireRecord for CurrentState {
    const NAME: &'static str = "CurrentState";
    const SIZE: usize = 14;

    fn read(r: &mut ByteReader<'_>) -> Self {
        Self {
            timestamp_sec: r.u32(),
            current_weight_g: r.i16(),
            bottle_level_ml: r.u16(),
            daily_total_ml: r.u16(),
            battery_percent: r.u8(),
            flags: StateFlags(r.u8()),
            unsynced_count: r.u16(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp_sec.to_le_bytes());
        out.extend_from_slice(&self.current_weight_g.to_le_bytes());
        out.extend_from_slice(&self.bottle_level_ml.to_le_bytes());
        out.extend_from_slice(&self.daily_total_ml.to_le_bytes());
        out.push(self.battery_percent);
        out.push(self.flags.0);
        out.extend_from_slice(&self.unsynced_count.to_le_bytes());
    }
}

/// Scale and bottle geometry. The device is the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BottleConfig {
    pub scale_factor: f32,
    pub tare_weight_grams: i32,
    pub capacity_ml: u16,
    pub daily_goal_ml: u16,
}

impl WireRecord for BottleConfig {
    const NAME: &'static str = "BottleConfig";
    const SIZE: usize = 12;

    fn read(r: &mut ByteReader<'_>) -> Self {
        Self {
            scale_factor: r.f32(),
            tare_weight_grams: r.i32(),
            capacity_ml: r.u16(),
            daily_goal_ml: r.u16(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.scale_factor.to_le_bytes());
        out.extend_from_slice(&self.tare_weight_grams.to_le_bytes());
        out.extend_from_slice(&self.capacity_ml.to_le_bytes());
        out.extend_from_slice(&self.daily_goal_ml.to_le_bytes());
    }
}

/// Sync control command codes.
pub mod sync_command {
    pub const START: u8 = 0x01;
    pub const ACK: u8 = 0x02;
}

/// Sync status reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncStatus {
    Idle = 0x00,
    InProgress = 0x01,
    Complete = 0x02,
    Error = 0x03,
}

impl SyncStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Idle),
            0x01 => Some(Self::InProgress),
            0x02 => Some(Self::Complete),
            0x03 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Control record exchanged on the sync-control characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncControl {
    pub start_index: u16,
    pub count: u16,
    pub command: u8,
    pub status: u8,
    pub chunk_size: u16,
}

impl SyncControl {
    /// Request the device to stream `count` unsynced records.
    pub fn start(count: u16) -> Self {
        Self {
            start_index: 0,
            count,
            command: sync_command::START,
            status: SyncStatus::Idle as u8,
            chunk_size: MAX_RECORDS_PER_CHUNK as u16,
        }
    }

    /// Acknowledge receipt of one chunk.
    pub fn ack(chunk_index: u16, record_count: u16) -> Self {
        Self {
            start_index: chunk_index,
            count: record_count,
            command: sync_command::ACK,
            status: SyncStatus::InProgress as u8,
            chunk_size: MAX_RECORDS_PER_CHUNK as u16,
        }
    }

    pub fn sync_status(&self) -> Option<SyncStatus> {
        SyncStatus::from_u8(self.status)
    }
}

impl WireRecord for SyncControl {
    const NAME: &'static str = "SyncControl";
    const SIZE: usize = 8;

    fn read(r: &mut ByteReader<'_>) -> Self {
        Self {
            start_index: r.u16(),
            count: r.u16(),
            command: r.u8(),
            status: r.u8(),
            chunk_size: r.u16(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start_index.to_le_bytes());
        out.extend_from_slice(&self.count.to_le_bytes());
        out.push(self.command);
        out.push(self.status);
        out.extend_from_slice(&self.chunk_size.to_le_bytes());
    }
}

/// DrinkRecord flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFlags(pub u8);

impl RecordFlags {
    pub const SYNCED: u8 = 0x01;
    pub const DELETED: u8 = 0x02;
}

/// One drink (or refill, when `amount_ml` is negative) logged by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrinkRecord {
    pub record_id: u32,
    pub timestamp_sec: u32,
    pub amount_ml: i16,
    pub bottle_level_ml: u16,
    pub drink_type: u8,
    pub flags: RecordFlags,
}

impl DrinkRecord {
    pub fn is_refill(&self) -> bool {
        self.amount_ml < 0
    }

    pub fn is_synced(&self) -> bool {
        self.flags.0 & RecordFlags::SYNCED != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.0 & RecordFlags::DELETED != 0
    }
}

impl WireRecord for DrinkRecord {
    const NAME: &'static str = "DrinkRecord";
    const SIZE: usize = 14;

    fn read(r: &mut ByteReader<'_>) -> Self {
        Self {
            record_id: r.u32(),
            timestamp_sec: r.u32(),
            amount_ml: r.i16(),
            bottle_level_ml: r.u16(),
            drink_type: r.u8(),
            flags: RecordFlags(r.u8()),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.record_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp_sec.to_le_bytes());
        out.extend_from_slice(&self.amount_ml.to_le_bytes());
        out.extend_from_slice(&self.bottle_level_ml.to_le_bytes());
        out.push(self.drink_type);
        out.push(self.flags.0);
    }
}

/// Header-prefixed batch of records used by every chunked transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<R> {
    pub chunk_index: u16,
    pub total_chunks: u16,
    pub records: Vec<R>,
}

/// Chunk of drink records streamed during a sync.
pub type DrinkDataChunk = Chunk<DrinkRecord>;

impl<R: WireRecord> Chunk<R> {
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < CHUNK_HEADER_SIZE {
            return Err(DecodeError::Truncated {
                structure: R::NAME,
                header: CHUNK_HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let mut r = ByteReader::new(buf);
        let chunk_index = r.u16();
        let total_chunks = r.u16();
        let declared = r.u8() as usize;
        r.skip(1);

        if declared > MAX_RECORDS_PER_CHUNK {
            return Err(DecodeError::TooManyRecords {
                structure: R::NAME,
                declared,
                limit: MAX_RECORDS_PER_CHUNK,
            });
        }

        let needed = CHUNK_HEADER_SIZE + declared * R::SIZE;
        if needed > buf.len() {
            return Err(DecodeError::Overrun {
                structure: R::NAME,
                declared,
                needed,
                available: buf.len(),
            });
        }

        let records = (0..declared).map(|_| R::read(&mut r)).collect();

        Ok(Self {
            chunk_index,
            total_chunks,
            records,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + self.records.len() * R::SIZE);
        out.extend_from_slice(&self.chunk_index.to_le_bytes());
        out.extend_from_slice(&self.total_chunks.to_le_bytes());
        out.push(self.records.len() as u8);
        out.push(0);
        for record in &self.records {
            record.write(&mut out);
        }
        out
    }
}

impl<R> Chunk<R> {
    /// Whether this is the final chunk by index.
    pub fn is_last(&self) -> bool {
        u32::from(self.chunk_index) + 1 >= u32::from(self.total_chunks)
    }

    /// The zero-filled header the firmware notifies when nothing is queued.
    pub fn is_empty_marker(&self) -> bool {
        self.total_chunks == 0 && self.records.is_empty()
    }
}

/// Fixed 4-byte command frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub opcode: u8,
    pub param1: u8,
    pub param2: u16,
}

impl WireRecord for CommandFrame {
    const NAME: &'static str = "Command";
    const SIZE: usize = 4;

    fn read(r: &mut ByteReader<'_>) -> Self {
        Self {
            opcode: r.u8(),
            param1: r.u8(),
            param2: r.u16(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.opcode);
        out.push(self.param1);
        out.extend_from_slice(&self.param2.to_le_bytes());
    }
}

/// Command opcodes understood by the firmware.
pub mod opcode {
    pub const TARE: u8 = 0x01;
    pub const PING: u8 = 0x02;
    pub const MEASURE_CALIBRATION_POINT: u8 = 0x03;
    pub const SET_CALIBRATION_DATA: u8 = 0x04;
    pub const RESET_DAILY: u8 = 0x05;
    pub const CLEAR_HISTORY: u8 = 0x06;
    pub const SET_TIME: u8 = 0x10;
    pub const DELETE_DRINK_RECORD: u8 = 0x12;
    pub const START_CALIBRATION: u8 = 0x20;
    pub const CANCEL_CALIBRATION: u8 = 0x21;
    pub const GET_ACTIVITY_SUMMARY: u8 = 0x30;
    pub const GET_MOTION_CHUNK: u8 = 0x31;
    pub const GET_BACKPACK_CHUNK: u8 = 0x32;
}

/// Calibration point selector for the measure command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CalibrationPoint {
    Empty = 0x00,
    Full = 0x01,
}

/// One-shot commands written to the command characteristic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DeviceCommand {
    Tare,
    Ping,
    MeasureCalibrationPoint(CalibrationPoint),
    SetCalibrationData {
        empty_adc: i32,
        full_adc: i32,
        scale_factor: f32,
    },
    ResetDaily,
    ClearHistory,
    SetTime(u32),
    DeleteDrinkRecord(u32),
    StartCalibration,
    CancelCalibration,
    GetActivitySummary,
    GetMotionChunk(u8),
    GetBackpackChunk(u8),
}

impl DeviceCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Tare => opcode::TARE,
            Self::Ping => opcode::PING,
            Self::MeasureCalibrationPoint(_) => opcode::MEASURE_CALIBRATION_POINT,
            Self::SetCalibrationData { .. } => opcode::SET_CALIBRATION_DATA,
            Self::ResetDaily => opcode::RESET_DAILY,
            Self::ClearHistory => opcode::CLEAR_HISTORY,
            Self::SetTime(_) => opcode::SET_TIME,
            Self::DeleteDrinkRecord(_) => opcode::DELETE_DRINK_RECORD,
            Self::StartCalibration => opcode::START_CALIBRATION,
            Self::CancelCalibration => opcode::CANCEL_CALIBRATION,
            Self::GetActivitySummary => opcode::GET_ACTIVITY_SUMMARY,
            Self::GetMotionChunk(_) => opcode::GET_MOTION_CHUNK,
            Self::GetBackpackChunk(_) => opcode::GET_BACKPACK_CHUNK,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tare => "tare",
            Self::Ping => "ping",
            Self::MeasureCalibrationPoint(_) => "measure-calibration-point",
            Self::SetCalibrationData { .. } => "set-calibration-data",
            Self::ResetDaily => "reset-daily",
            Self::ClearHistory => "clear-history",
            Self::SetTime(_) => "set-time",
            Self::DeleteDrinkRecord(_) => "delete-drink-record",
            Self::StartCalibration => "start-calibration",
            Self::CancelCalibration => "cancel-calibration",
            Self::GetActivitySummary => "get-activity-summary",
            Self::GetMotionChunk(_) => "get-motion-chunk",
            Self::GetBackpackChunk(_) => "get-backpack-chunk",
        }
    }

    /// Encode to wire bytes.
    ///
    /// Simple commands use the 4-byte frame; commands with a payload append it
    /// directly after the opcode byte.
    pub fn encode(&self) -> Vec<u8> {
        let op = self.opcode();
        match *self {
            Self::SetCalibrationData {
                empty_adc,
                full_adc,
                scale_factor,
            } => {
                let mut out = Vec::with_capacity(14);
                out.push(op);
                out.extend_from_slice(&empty_adc.to_le_bytes());
                out.extend_from_slice(&full_adc.to_le_bytes());
                out.extend_from_slice(&scale_factor.to_le_bytes());
                out.push(1);
                out
            }
            Self::SetTime(value) | Self::DeleteDrinkRecord(value) => {
                let mut out = Vec::with_capacity(5);
                out.push(op);
                out.extend_from_slice(&value.to_le_bytes());
                out
            }
            Self::MeasureCalibrationPoint(point) => frame(op, point as u8),
            Self::GetMotionChunk(index) | Self::GetBackpackChunk(index) => frame(op, index),
            _ => frame(op, 0),
        }
    }
}

fn frame(opcode: u8, param1: u8) -> Vec<u8> {
    CommandFrame {
        opcode,
        param1,
        param2: 0,
    }
    .encode()
}

/// User-facing device settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub flags: u8,
}

impl DeviceSettings {
    pub const SHAKE_TO_EMPTY: u8 = 0x01;

    pub fn shake_to_empty(&self) -> bool {
        self.flags & Self::SHAKE_TO_EMPTY != 0
    }

    pub fn with_shake_to_empty(mut self, enabled: bool) -> Self {
        if enabled {
            self.flags |= Self::SHAKE_TO_EMPTY;
        } else {
            self.flags &= !Self::SHAKE_TO_EMPTY;
        }
        self
    }
}

impl WireRecord for DeviceSettings {
    const NAME: &'static str = "DeviceSettings";
    const SIZE: usize = 4;

    fn read(r: &mut ByteReader<'_>) -> Self {
        let flags = r.u8();
        r.skip(3);
        Self { flags }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.flags);
        out.extend_from_slice(&[0, 0, 0]);
    }
}

/// Calibration progress as reported by the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationState {
    pub state: u8,
    pub flags: u8,
    pub empty_adc: i32,
    pub full_adc: i32,
}

impl CalibrationState {
    pub const ERROR: u8 = 0x01;

    pub fn has_error(&self) -> bool {
        self.flags & Self::ERROR != 0
    }
}

impl WireRecord for CalibrationState {
    const NAME: &'static str = "CalibrationState";
    const SIZE: usize = 12;

    fn read(r: &mut ByteReader<'_>) -> Self {
        let state = Self {
            state: r.u8(),
            flags: r.u8(),
            empty_adc: r.i32(),
            full_adc: r.i32(),
        };
        r.skip(2);
        state
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.state);
        out.push(self.flags);
        out.extend_from_slice(&self.empty_adc.to_le_bytes());
        out.extend_from_slice(&self.full_adc.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
    }
}

/// Summary of motion and backpack activity since the last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub motion_event_count: u8,
    pub backpack_session_count: u8,
    pub flags: u8,
    pub current_session_start_sec: u32,
}

impl ActivitySummary {
    pub const IN_BACKPACK_MODE: u8 = 0x01;

    pub fn in_backpack_mode(&self) -> bool {
        self.flags & Self::IN_BACKPACK_MODE != 0
    }
}

impl WireRecord for ActivitySummary {
    const NAME: &'static str = "ActivitySummary";
    const SIZE: usize = 8;

    fn read(r: &mut ByteReader<'_>) -> Self {
        let motion_event_count = r.u8();
        let backpack_session_count = r.u8();
        let flags = r.u8();
        r.skip(1);
        Self {
            motion_event_count,
            backpack_session_count,
            flags,
            current_session_start_sec: r.u32(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.motion_event_count);
        out.push(self.backpack_session_count);
        out.push(self.flags);
        out.push(0);
        out.extend_from_slice(&self.current_session_start_sec.to_le_bytes());
    }
}

/// One wake from deep sleep triggered by motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionWakeEvent {
    pub timestamp_sec: u32,
    pub duration_sec: u16,
    pub wake_reason: u8,
    pub sleep_type: u8,
}

impl WireRecord for MotionWakeEvent {
    const NAME: &'static str = "MotionWakeEvent";
    const SIZE: usize = 8;

    fn read(r: &mut ByteReader<'_>) -> Self {
        Self {
            timestamp_sec: r.u32(),
            duration_sec: r.u16(),
            wake_reason: r.u8(),
            sleep_type: r.u8(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp_sec.to_le_bytes());
        out.extend_from_slice(&self.duration_sec.to_le_bytes());
        out.push(self.wake_reason);
        out.push(self.sleep_type);
    }
}

/// A period the bottle spent in continuous motion (carried in a bag).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpackSession {
    pub start_timestamp_sec: u32,
    pub duration_sec: u32,
    pub timer_wake_count: u16,
    pub exit_reason: u8,
    pub flags: u8,
}

impl WireRecord for BackpackSession {
    const NAME: &'static str = "BackpackSession";
    const SIZE: usize = 12;

    fn read(r: &mut ByteReader<'_>) -> Self {
        Self {
            start_timestamp_sec: r.u32(),
            duration_sec: r.u32(),
            timer_wake_count: r.u16(),
            exit_reason: r.u8(),
            flags: r.u8(),
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.start_timestamp_sec.to_le_bytes());
        out.extend_from_slice(&self.duration_sec.to_le_bytes());
        out.extend_from_slice(&self.timer_wake_count.to_le_bytes());
        out.push(self.exit_reason);
        out.push(self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drink(id: u32) -> DrinkRecord {
        DrinkRecord {
            record_id: id,
            timestamp_sec: 1_700_000_000 + id,
            amount_ml: 150,
            bottle_level_ml: 500,
            drink_type: 0,
            flags: RecordFlags::default(),
        }
    }

    #[test]
    fn test_current_state_decode() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1_700_000_000u32.to_le_bytes());
        buf.extend_from_slice(&(-5i16).to_le_bytes());
        buf.extend_from_slice(&420u16.to_le_bytes());
        buf.extend_from_slice(&900u16.to_le_bytes());
        buf.push(72);
        buf.push(0x07);
        buf.extend_from_slice(&3u16.to_le_bytes());
        assert_eq!(buf.len(), 14);

        let state = CurrentState::decode(&buf).unwrap();
        assert_eq!(state.timestamp_sec, 1_700_000_000);
        assert_eq!(state.current_weight_g, -5);
        assert_eq!(state.bottle_level_ml, 420);
        assert_eq!(state.daily_total_ml, 900);
        assert_eq!(state.battery_percent, 72);
        assert!(state.is_time_valid());
        assert!(state.is_calibrated());
        assert!(state.is_stable());
        assert!(!state.is_cal_measuring());
        assert!(!state.is_cal_result_ready());
        assert_eq!(state.unsynced_count, 3);
        assert_eq!(state.calibration_adc(), None);
    }

    #[test]
    fn test_fixed_size_rejects_wrong_length() {
        assert!(matches!(
            CurrentState::decode(&[0u8; 13]),
            Err(DecodeError::Length {
                expected: 14,
                actual: 13,
                ..
            })
        ));
        assert!(CurrentState::decode(&[0u8; 15]).is_err());
        assert!(BottleConfig::decode(&[0u8; 11]).is_err());
        assert!(SyncControl::decode(&[]).is_err());
        assert!(DeviceSettings::decode(&[0u8; 5]).is_err());
        assert!(CalibrationState::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_decode_from_unaligned_slice() {
        let config = BottleConfig {
            scale_factor: 5.25,
            tare_weight_grams: -1234,
            capacity_ml: 830,
            daily_goal_ml: 2500,
        };
        let mut buf = vec![0xAA];
        buf.extend(config.encode());
        assert_eq!(BottleConfig::decode(&buf[1..]).unwrap(), config);
    }

    #[test]
    fn test_round_trip_fixed_structures() {
        let state = CurrentState {
            timestamp_sec: u32::MAX,
            current_weight_g: i16::MIN,
            bottle_level_ml: u16::MAX,
            daily_total_ml: 0,
            battery_percent: 100,
            flags: StateFlags(0x1F),
            unsynced_count: 600,
        };
        assert_eq!(CurrentState::decode(&state.encode()).unwrap(), state);

        let control = SyncControl::ack(7, 20);
        assert_eq!(SyncControl::decode(&control.encode()).unwrap(), control);

        let record = DrinkRecord {
            amount_ml: -300,
            flags: RecordFlags(RecordFlags::SYNCED | RecordFlags::DELETED),
            ..drink(42)
        };
        let decoded = DrinkRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded, record);
        assert!(decoded.is_refill());
        assert!(decoded.is_synced());
        assert!(decoded.is_deleted());

        let cal = CalibrationState {
            state: 3,
            flags: CalibrationState::ERROR,
            empty_adc: -20,
            full_adc: 1 << 20,
        };
        assert_eq!(CalibrationState::decode(&cal.encode()).unwrap(), cal);

        let settings = DeviceSettings::default().with_shake_to_empty(true);
        assert_eq!(DeviceSettings::decode(&settings.encode()).unwrap(), settings);
    }

    #[test]
    fn test_sync_control_layout() {
        let bytes = SyncControl::start(25).encode();
        assert_eq!(bytes, vec![0x00, 0x00, 25, 0x00, 0x01, 0x00, 20, 0x00]);
        assert_eq!(
            SyncControl::decode(&bytes).unwrap().sync_status(),
            Some(SyncStatus::Idle)
        );
    }

    #[test]
    fn test_calibration_adc_reconstruction() {
        let adc: i32 = -123_456;
        let state = CurrentState {
            timestamp_sec: 0,
            current_weight_g: (adc as u32 & 0xFFFF) as u16 as i16,
            bottle_level_ml: (adc as u32 >> 16) as u16,
            daily_total_ml: 0,
            battery_percent: 50,
            flags: StateFlags(StateFlags::CAL_RESULT_READY),
            unsynced_count: 0,
        };
        assert_eq!(state.calibration_adc(), Some(adc));

        let positive = CurrentState {
            current_weight_g: 0x1388,
            bottle_level_ml: 0x0001,
            ..state
        };
        assert_eq!(positive.calibration_adc(), Some(0x0001_1388));
    }

    #[test]
    fn test_chunk_decode() {
        let chunk = DrinkDataChunk {
            chunk_index: 1,
            total_chunks: 3,
            records: (0..10).map(drink).collect(),
        };
        let bytes = chunk.encode();
        assert_eq!(bytes.len(), 6 + 14 * 10);

        let decoded = DrinkDataChunk::decode(&bytes).unwrap();
        assert_eq!(decoded, chunk);
        assert!(!decoded.is_last());
    }

    #[test]
    fn test_chunk_rejects_overrun() {
        let chunk = DrinkDataChunk {
            chunk_index: 0,
            total_chunks: 1,
            records: (0..3).map(drink).collect(),
        };
        let mut bytes = chunk.encode();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            DrinkDataChunk::decode(&bytes),
            Err(DecodeError::Overrun { declared: 3, .. })
        ));
    }

    #[test]
    fn test_chunk_rejects_truncated_header_and_excess_count() {
        assert!(matches!(
            DrinkDataChunk::decode(&[0, 0, 1]),
            Err(DecodeError::Truncated { .. })
        ));

        let mut bytes = vec![0, 0, 1, 0, 21, 0];
        bytes.extend(vec![0u8; 21 * 14]);
        assert!(matches!(
            DrinkDataChunk::decode(&bytes),
            Err(DecodeError::TooManyRecords { declared: 21, .. })
        ));
    }

    #[test]
    fn test_zero_header_is_empty_marker() {
        let chunk = DrinkDataChunk::decode(&[0u8; 6]).unwrap();
        assert!(chunk.is_empty_marker());
        assert!(chunk.records.is_empty());
    }

    #[test]
    fn test_last_chunk_detection() {
        let last = Chunk::<DrinkRecord> {
            chunk_index: 2,
            total_chunks: 3,
            records: vec![],
        };
        assert!(last.is_last());
        let overshoot = Chunk::<DrinkRecord> {
            chunk_index: u16::MAX,
            total_chunks: u16::MAX,
            records: vec![],
        };
        assert!(overshoot.is_last());
    }

    #[test]
    fn test_simple_command_encoding() {
        assert_eq!(DeviceCommand::Tare.encode(), vec![0x01, 0, 0, 0]);
        assert_eq!(DeviceCommand::Ping.encode(), vec![0x02, 0, 0, 0]);
        assert_eq!(
            DeviceCommand::MeasureCalibrationPoint(CalibrationPoint::Full).encode(),
            vec![0x03, 0x01, 0, 0]
        );
        assert_eq!(DeviceCommand::GetMotionChunk(4).encode(), vec![0x31, 4, 0, 0]);
        assert_eq!(DeviceCommand::CancelCalibration.encode(), vec![0x21, 0, 0, 0]);

        let frame = CommandFrame::decode(&DeviceCommand::ResetDaily.encode()).unwrap();
        assert_eq!(frame.opcode, opcode::RESET_DAILY);
    }

    #[test]
    fn test_payload_command_encoding() {
        assert_eq!(
            DeviceCommand::SetTime(0x6553_F100).encode(),
            vec![0x10, 0x00, 0xF1, 0x53, 0x65]
        );
        assert_eq!(
            DeviceCommand::DeleteDrinkRecord(7).encode(),
            vec![0x12, 7, 0, 0, 0]
        );

        let bytes = DeviceCommand::SetCalibrationData {
            empty_adc: 1000,
            full_adc: 5000,
            scale_factor: 5.0,
        }
        .encode();
        assert_eq!(bytes.len(), 14);
        assert_eq!(bytes[0], opcode::SET_CALIBRATION_DATA);
        assert_eq!(&bytes[1..5], &1000i32.to_le_bytes());
        assert_eq!(&bytes[5..9], &5000i32.to_le_bytes());
        assert_eq!(&bytes[9..13], &5.0f32.to_le_bytes());
        assert_eq!(bytes[13], 1);
    }

    #[test]
    fn test_activity_structures() {
        let summary = ActivitySummary {
            motion_event_count: 12,
            backpack_session_count: 2,
            flags: ActivitySummary::IN_BACKPACK_MODE,
            current_session_start_sec: 1_700_000_100,
        };
        let decoded = ActivitySummary::decode(&summary.encode()).unwrap();
        assert_eq!(decoded, summary);
        assert!(decoded.in_backpack_mode());

        let chunk = Chunk {
            chunk_index: 0,
            total_chunks: 1,
            records: vec![BackpackSession {
                start_timestamp_sec: 10,
                duration_sec: 3600,
                timer_wake_count: 12,
                exit_reason: 1,
                flags: 0,
            }],
        };
        let bytes = chunk.encode();
        assert_eq!(bytes.len(), 6 + 12);
        assert_eq!(Chunk::<BackpackSession>::decode(&bytes).unwrap(), chunk);
        assert!(Chunk::<MotionWakeEvent>::decode(&bytes[..10]).is_err());
    }
}
