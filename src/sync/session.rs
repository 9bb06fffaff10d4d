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

//! Chunked drink-record transfer.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bluetooth::protocol::{DrinkDataChunk, DrinkRecord, SyncControl, SyncStatus};

/// Why a sync ended without handing records to storage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncFailure {
    #[error("malformed drink data: {0}")]
    Malformed(String),
    #[error("bottle disconnected during sync")]
    Disconnected,
    #[error("bottle reported a sync error")]
    DeviceError,
    #[error("bottle stopped sending drink data")]
    Timeout,
    #[error("sync control write failed: {0}")]
    WriteFailed(String),
}

/// Externally visible sync phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    /// START written, first chunk not seen yet.
    Requested,
    InProgress,
    Failed(SyncFailure),
}

struct SyncSession {
    expected_total_chunks: u16,
    last_chunk_index_seen: Option<u16>,
    buffer: Vec<DrinkRecord>,
    progress: f32,
}

impl SyncSession {
    fn new() -> Self {
        Self {
            expected_total_chunks: 0,
            last_chunk_index_seen: None,
            buffer: Vec::new(),
            progress: 0.0,
        }
    }
}

/// Result of feeding one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Nothing to do (empty marker or stray chunk).
    Ignored,
    /// Chunk buffered; write `ack`.
    Accepted { ack: SyncControl, progress: f32 },
    /// Final chunk buffered; write `ack` and hand `records` to storage.
    Completed {
        ack: SyncControl,
        records: Vec<DrinkRecord>,
    },
}

/// Result of a control-channel update.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlOutcome {
    Nothing,
    Completed(Vec<DrinkRecord>),
    Failed(SyncFailure),
}

/// Reassembles drink records from `DrinkDataChunk` notifications.
///
/// At most one session exists. Completion resets to idle so the next sync can
/// start immediately; failure leaves a `Failed` marker until the next start.
pub struct SyncEngine {
    session: Option<SyncSession>,
    last_failure: Option<SyncFailure>,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self {
            session: None,
            last_failure: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn phase(&self) -> SyncPhase {
        match (&self.session, &self.last_failure) {
            (Some(s), _) if s.last_chunk_index_seen.is_none() => SyncPhase::Requested,
            (Some(_), _) => SyncPhase::InProgress,
            (None, Some(failure)) => SyncPhase::Failed(failure.clone()),
            (None, None) => SyncPhase::Idle,
        }
    }

    pub fn progress(&self) -> Option<f32> {
        self.session.as_ref().map(|s| s.progress)
    }

    /// Open a session. Returns the START record to write, or `None` when a
    /// session is already active.
    pub fn start(&mut self, count: u16) -> Option<SyncControl> {
        if self.session.is_some() {
            debug!("Sync already active, ignoring start");
            return None;
        }

        info!("Starting sync of {} records", count);
        self.last_failure = None;
        self.session = Some(SyncSession::new());
        Some(SyncControl::start(count))
    }

    /// Process one decoded chunk.
    pub fn on_chunk(&mut self, chunk: DrinkDataChunk) -> ChunkOutcome {
        if chunk.is_empty_marker() {
            debug!("Ignoring empty drink data notification");
            return ChunkOutcome::Ignored;
        }

        let index = chunk.chunk_index;
        if self.session.is_none() {
            if index != 0 {
                warn!("Chunk {} arrived with no sync active", index);
                return ChunkOutcome::Ignored;
            }
            info!("Bottle started a sync on its own");
            self.last_failure = None;
            self.session = Some(SyncSession::new());
        }
        let Some(session) = self.session.as_mut() else {
            return ChunkOutcome::Ignored;
        };

        if index == 0 {
            if session.last_chunk_index_seen.is_some() {
                warn!(
                    "Sync restarted by bottle, dropping {} buffered records",
                    session.buffer.len()
                );
                session.buffer.clear();
            }
            session.expected_total_chunks = chunk.total_chunks;
        } else {
            let expected = session
                .last_chunk_index_seen
                .map(|i| i.wrapping_add(1))
                .unwrap_or(0);
            if index != expected {
                warn!(
                    "Chunk sequence gap: expected {}, got {} (continuing)",
                    expected, index
                );
            }
            if session.expected_total_chunks == 0 {
                session.expected_total_chunks = chunk.total_chunks;
            }
        }

        let record_count = chunk.records.len() as u16;
        session.buffer.extend(chunk.records.iter().copied());
        session.last_chunk_index_seen = Some(index);

        let total = session.expected_total_chunks.max(1) as f32;
        session.progress = ((f32::from(index) + 1.0) / total).min(1.0);

        debug!(
            "Chunk {}/{} with {} records ({} buffered)",
            u32::from(index) + 1,
            session.expected_total_chunks,
            record_count,
            session.buffer.len()
        );

        let ack = SyncControl::ack(index, record_count);
        if chunk.is_last() {
            let records = self.finish();
            ChunkOutcome::Completed { ack, records }
        } else {
            ChunkOutcome::Accepted {
                ack,
                progress: session.progress,
            }
        }
    }

    /// Process a status update from the control channel. The device's
    /// "complete" status is authoritative over chunk indices.
    pub fn on_control(&mut self, control: SyncControl) -> ControlOutcome {
        match control.sync_status() {
            Some(SyncStatus::Complete) => {
                let Some(session) = &self.session else {
                    debug!("Sync complete status with no active session");
                    return ControlOutcome::Nothing;
                };

                let received = session
                    .last_chunk_index_seen
                    .map(|i| u32::from(i) + 1)
                    .unwrap_or(0);
                if received < u32::from(session.expected_total_chunks) {
                    warn!(
                        "Bottle reported complete after {} of {} chunks",
                        received, session.expected_total_chunks
                    );
                }
                ControlOutcome::Completed(self.finish())
            }
            Some(SyncStatus::Error) if self.session.is_some() => {
                warn!("Bottle reported a sync error");
                self.fail(SyncFailure::DeviceError);
                ControlOutcome::Failed(SyncFailure::DeviceError)
            }
            Some(status) => {
                debug!("Sync status {:?}", status);
                ControlOutcome::Nothing
            }
            None => {
                warn!("Unknown sync status 0x{:02X}", control.status);
                ControlOutcome::Nothing
            }
        }
    }

    /// Forget the last failure, e.g. on a fresh link.
    pub fn clear_failure(&mut self) {
        self.last_failure = None;
    }

    /// Abort the active session, discarding buffered records.
    /// Returns `false` when no session was active.
    pub fn fail(&mut self, reason: SyncFailure) -> bool {
        match self.session.take() {
            Some(session) => {
                warn!(
                    "Sync failed: {} ({} buffered records discarded)",
                    reason,
                    session.buffer.len()
                );
                self.last_failure = Some(reason);
                true
            }
            None => false,
        }
    }

    fn finish(&mut self) -> Vec<DrinkRecord> {
        let records = self
            .session
            .take()
            .map(|s| s.buffer)
            .unwrap_or_default();
        info!("Sync complete: {} records", records.len());
        records
    }
}

impl Default for SyncEngine {
    fn default() -> Self {
        Self::new()
    }
}
