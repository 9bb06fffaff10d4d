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

//! On-demand activity diagnostics fetched over the activity stats channel.
//!
//! Motion and backpack histories are pulled one chunk per command; the next
//! chunk is requested when the previous one arrives.

use tracing::{debug, warn};

use crate::bluetooth::protocol::{
    ActivitySummary, BackpackSession, Chunk, DeviceCommand, MotionWakeEvent, WireRecord,
};

/// What to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticsKind {
    Summary,
    MotionEvents,
    BackpackSessions,
}

enum Fetch {
    Summary,
    Motion(Vec<MotionWakeEvent>),
    Backpack(Vec<BackpackSession>),
}

/// Result of feeding an activity stats value.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticsOutcome {
    /// Value not expected; dropped.
    Nothing,
    /// Write this command to pull the next chunk.
    Request(DeviceCommand),
    Summary(ActivitySummary),
    MotionEvents(Vec<MotionWakeEvent>),
    BackpackSessions(Vec<BackpackSession>),
    Failed(String),
}

/// Tracks the single diagnostics fetch in flight.
#[derive(Default)]
pub struct DiagnosticsFetcher {
    fetch: Option<Fetch>,
}

impl DiagnosticsFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.fetch.is_some()
    }

    /// Start a fetch, returning the first command to write.
    pub fn begin(&mut self, kind: DiagnosticsKind) -> Option<DeviceCommand> {
        if self.fetch.is_some() {
            debug!("Diagnostics fetch already running, ignoring {:?}", kind);
            return None;
        }

        let (fetch, command) = match kind {
            DiagnosticsKind::Summary => (Fetch::Summary, DeviceCommand::GetActivitySummary),
            DiagnosticsKind::MotionEvents => {
                (Fetch::Motion(Vec::new()), DeviceCommand::GetMotionChunk(0))
            }
            DiagnosticsKind::BackpackSessions => {
                (Fetch::Backpack(Vec::new()), DeviceCommand::GetBackpackChunk(0))
            }
        };
        self.fetch = Some(fetch);
        Some(command)
    }

    pub fn on_value(&mut self, value: &[u8]) -> DiagnosticsOutcome {
        let Some(fetch) = self.fetch.take() else {
            debug!("Unsolicited activity stats value ({} bytes)", value.len());
            return DiagnosticsOutcome::Nothing;
        };

        match fetch {
            Fetch::Summary => match ActivitySummary::decode(value) {
                Ok(summary) => DiagnosticsOutcome::Summary(summary),
                Err(e) => {
                    warn!("Discarding activity summary: {}", e);
                    DiagnosticsOutcome::Failed(e.to_string())
                }
            },
            Fetch::Motion(mut events) => {
                match self.advance(value, &mut events, DeviceCommand::GetMotionChunk) {
                    Step::Continue(command) => {
                        self.fetch = Some(Fetch::Motion(events));
                        DiagnosticsOutcome::Request(command)
                    }
                    Step::Done => DiagnosticsOutcome::MotionEvents(events),
                    Step::Failed(reason) => DiagnosticsOutcome::Failed(reason),
                }
            }
            Fetch::Backpack(mut sessions) => {
                match self.advance(value, &mut sessions, DeviceCommand::GetBackpackChunk) {
                    Step::Continue(command) => {
                        self.fetch = Some(Fetch::Backpack(sessions));
                        DiagnosticsOutcome::Request(command)
                    }
                    Step::Done => DiagnosticsOutcome::BackpackSessions(sessions),
                    Step::Failed(reason) => DiagnosticsOutcome::Failed(reason),
                }
            }
        }
    }

    fn advance<R: WireRecord>(
        &self,
        value: &[u8],
        items: &mut Vec<R>,
        next: fn(u8) -> DeviceCommand,
    ) -> Step {
        let chunk = match Chunk::<R>::decode(value) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Discarding {} chunk: {}", R::NAME, e);
                return Step::Failed(e.to_string());
            }
        };

        if chunk.is_empty_marker() {
            return Step::Done;
        }

        debug!(
            "{} chunk {}/{} with {} records",
            R::NAME,
            u32::from(chunk.chunk_index) + 1,
            chunk.total_chunks,
            chunk.records.len()
        );
        let is_last = chunk.is_last();
        let index = chunk.chunk_index;
        items.extend(chunk.records);

        if is_last {
            return Step::Done;
        }
        match u8::try_from(u32::from(index) + 1) {
            Ok(next_index) => Step::Continue(next(next_index)),
            Err(_) => {
                warn!("{} history exceeds addressable chunks, stopping", R::NAME);
                Step::Done
            }
        }
    }

    /// Abandon the fetch in flight. Returns `false` when none was running.
    pub fn abort(&mut self) -> bool {
        self.fetch.take().is_some()
    }
}

enum Step {
    Continue(DeviceCommand),
    Done,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn motion(ts: u32) -> MotionWakeEvent {
        MotionWakeEvent {
            timestamp_sec: ts,
            duration_sec: 30,
            wake_reason: 1,
            sleep_type: 0,
        }
    }

    #[test]
    fn test_summary_fetch() {
        let mut fetcher = DiagnosticsFetcher::new();
        assert_eq!(
            fetcher.begin(DiagnosticsKind::Summary),
            Some(DeviceCommand::GetActivitySummary)
        );
        assert!(fetcher.begin(DiagnosticsKind::MotionEvents).is_none());

        let summary = ActivitySummary {
            motion_event_count: 3,
            backpack_session_count: 0,
            flags: 0,
            current_session_start_sec: 0,
        };
        assert_eq!(
            fetcher.on_value(&summary.encode()),
            DiagnosticsOutcome::Summary(summary)
        );
        assert!(!fetcher.is_busy());
    }

    #[test]
    fn test_motion_fetch_pulls_every_chunk() {
        let mut fetcher = DiagnosticsFetcher::new();
        assert_eq!(
            fetcher.begin(DiagnosticsKind::MotionEvents),
            Some(DeviceCommand::GetMotionChunk(0))
        );

        let first = Chunk {
            chunk_index: 0,
            total_chunks: 2,
            records: vec![motion(1), motion(2)],
        };
        assert_eq!(
            fetcher.on_value(&first.encode()),
            DiagnosticsOutcome::Request(DeviceCommand::GetMotionChunk(1))
        );

        let second = Chunk {
            chunk_index: 1,
            total_chunks: 2,
            records: vec![motion(3)],
        };
        assert_eq!(
            fetcher.on_value(&second.encode()),
            DiagnosticsOutcome::MotionEvents(vec![motion(1), motion(2), motion(3)])
        );
        assert!(!fetcher.is_busy());
    }

    #[test]
    fn test_empty_history() {
        let mut fetcher = DiagnosticsFetcher::new();
        fetcher.begin(DiagnosticsKind::BackpackSessions);
        assert_eq!(
            fetcher.on_value(&[0u8; 6]),
            DiagnosticsOutcome::BackpackSessions(vec![])
        );
    }

    #[test]
    fn test_malformed_chunk_fails_fetch() {
        let mut fetcher = DiagnosticsFetcher::new();
        fetcher.begin(DiagnosticsKind::MotionEvents);
        assert!(matches!(
            fetcher.on_value(&[0, 0, 1, 0, 2, 0, 1]),
            DiagnosticsOutcome::Failed(_)
        ));
        assert!(!fetcher.is_busy());
        assert_eq!(fetcher.on_value(&[0u8; 8]), DiagnosticsOutcome::Nothing);
    }
}
