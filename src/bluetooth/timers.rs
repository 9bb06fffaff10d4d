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

//! Cancellable protocol timers.
//!
//! Each timer is a spawned task that posts `EngineEvent::Timer` back to the
//! engine queue. A timer may fire after it was cancelled (the event is already
//! queued), so every expiry carries a token and stale tokens are dropped.

use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::events::EngineEvent;

/// Timers owned by the engine. At most one of each kind is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimerKind {
    Scan,
    Connection,
    ReconnectGrace,
    IdleDisconnect,
    SyncInactivity,
    DeleteConfirmation,
    CalibrationMeasurement,
    CalibrationProgress,
    CalibrationSave,
    DiagnosticsFetch,
}

struct ArmedTimer {
    token: u64,
    handle: JoinHandle<()>,
}

/// Set of armed timers keyed by kind.
pub struct TimerSet {
    event_tx: mpsc::Sender<EngineEvent>,
    armed: HashMap<TimerKind, ArmedTimer>,
    next_token: u64,
}

impl TimerSet {
    pub fn new(event_tx: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            event_tx,
            armed: HashMap::new(),
            next_token: 0,
        }
    }

    /// Arm `kind` to fire after `after`, replacing any armed timer of that kind.
    pub fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.cancel(kind);

        self.next_token += 1;
        let token = self.next_token;
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = event_tx.send(EngineEvent::Timer { kind, token }).await;
        });

        trace!("Armed {:?} timer ({:?}, token {})", kind, after, token);
        self.armed.insert(kind, ArmedTimer { token, handle });
    }

    /// Cancel `kind`. Cancelling a timer that is not armed is a no-op.
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some(timer) = self.armed.remove(&kind) {
            timer.handle.abort();
            trace!("Cancelled {:?} timer", kind);
        }
    }

    pub fn cancel_all(&mut self, kinds: &[TimerKind]) {
        for kind in kinds {
            self.cancel(*kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Accept an expiry. Returns `false` when the token is stale because the
    /// timer was cancelled or re-armed after the event was queued.
    pub fn take_fired(&mut self, kind: TimerKind, token: u64) -> bool {
        match self.armed.get(&kind) {
            Some(timer) if timer.token == token => {
                self.armed.remove(&kind);
                true
            }
            _ => false,
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.handle.abort();
        }
    }
}
