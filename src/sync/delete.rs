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

//! Pessimistic delete handshake.
//!
//! The bottle has no explicit delete ack. The next CurrentState notification
//! after the delete command is taken as confirmation that the record is gone
//! and the daily total recalculated.

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bluetooth::protocol::DeviceCommand;

/// A delete waiting for confirmation.
#[derive(Debug)]
pub struct PendingDelete {
    pub record_id: u32,
    reply: oneshot::Sender<bool>,
}

impl PendingDelete {
    /// Report the outcome to the requester.
    pub fn resolve(self, confirmed: bool) {
        if self.reply.send(confirmed).is_err() {
            debug!("Delete requester for {} went away", self.record_id);
        }
    }
}

/// Tracks the single in-flight delete.
#[derive(Debug, Default)]
pub struct DeleteTracker {
    pending: Option<PendingDelete>,
}

impl DeleteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Register a delete and return the command to write. A second delete
    /// while one is pending is refused right away.
    pub fn begin(&mut self, record_id: u32, reply: oneshot::Sender<bool>) -> Option<DeviceCommand> {
        if let Some(pending) = &self.pending {
            warn!(
                "Delete of {} refused, {} still awaiting confirmation",
                record_id, pending.record_id
            );
            let _ = reply.send(false);
            return None;
        }

        self.pending = Some(PendingDelete { record_id, reply });
        Some(DeviceCommand::DeleteDrinkRecord(record_id))
    }

    /// Take the pending delete, e.g. on confirmation, timeout or disconnect.
    pub fn take(&mut self) -> Option<PendingDelete> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pending_delete() {
        let mut tracker = DeleteTracker::new();
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        assert_eq!(
            tracker.begin(7, tx1),
            Some(DeviceCommand::DeleteDrinkRecord(7))
        );
        assert!(tracker.is_pending());

        assert_eq!(tracker.begin(8, tx2), None);
        assert_eq!(rx2.try_recv(), Ok(false));
    }

    #[test]
    fn test_resolve_reports_outcome() {
        let mut tracker = DeleteTracker::new();
        let (tx, mut rx) = oneshot::channel();
        tracker.begin(7, tx);

        let pending = tracker.take().unwrap();
        assert_eq!(pending.record_id, 7);
        pending.resolve(true);
        assert_eq!(rx.try_recv(), Ok(true));
        assert!(!tracker.is_pending());
        assert!(tracker.take().is_none());
    }
}
