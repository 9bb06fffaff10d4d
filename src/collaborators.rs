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

//! Interfaces the engine consumes from the surrounding application.
//!
//! All of them are injected at construction; the engine never holds a
//! reference back into the application.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::bluetooth::protocol::DrinkRecord;
use crate::bluetooth::DeviceId;

/// Local copy of the drink history.
pub trait Storage: Send {
    /// Store records received from `device`. Already known records are ignored.
    fn persist(&mut self, records: &[DrinkRecord], device: &DeviceId) -> Result<()>;

    /// Drinks (positive amounts) not yet mirrored to the health platform.
    /// Refills stay local and are never returned.
    fn unsynced_records(&self) -> Result<Vec<DrinkRecord>>;

    /// Attach the health platform identifier to a stored record.
    fn link_health_sample(&mut self, device_record_id: u32, external_id: &str) -> Result<()>;

    /// Delete by local id, returning the linked health sample if there was one.
    fn delete_record(&mut self, id: i64) -> Result<Option<String>>;

    /// Map a device-assigned record id to the local id.
    fn lookup_record_id(&self, device_record_id: u32) -> Result<Option<i64>>;
}

/// Health platform mirror.
pub trait HealthMirror: Send {
    fn is_enabled(&self) -> bool;

    fn is_authorized(&self) -> bool;

    /// Log a water sample and return its external identifier.
    fn log_sample(&mut self, amount_ml: u16, at: DateTime<Utc>) -> Result<String>;

    fn delete_sample(&mut self, external_id: &str) -> Result<()>;
}

/// Daily hydration figures pushed to a companion device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HydrationSnapshot {
    pub timestamp_sec: u32,
    pub daily_total_ml: u16,
    pub daily_goal_ml: u16,
    pub bottle_level_ml: u16,
    pub battery_percent: u8,
}

impl HydrationSnapshot {
    /// How far the day's total is below goal.
    pub fn deficit_ml(&self) -> u16 {
        self.daily_goal_ml.saturating_sub(self.daily_total_ml)
    }
}

/// Companion-device sync. Fire-and-forget.
pub trait CompanionSync: Send {
    fn push(&mut self, snapshot: &HydrationSnapshot);
}

/// Reminder urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReminderUrgency {
    Gentle,
    Firm,
    Urgent,
}

impl ReminderUrgency {
    /// Pick an urgency from the share of the goal still missing.
    pub fn for_deficit(deficit_ml: u16, goal_ml: u16) -> Option<Self> {
        if deficit_ml == 0 || goal_ml == 0 {
            return None;
        }
        let missing = f32::from(deficit_ml) / f32::from(goal_ml);
        Some(if missing > 0.6 {
            Self::Urgent
        } else if missing > 0.3 {
            Self::Firm
        } else {
            Self::Gentle
        })
    }
}

/// Local notification scheduler, driven by the application after a sync.
pub trait ReminderScheduler: Send {
    fn schedule_reminder(&mut self, urgency: ReminderUrgency, deficit_ml: u16);
}

/// Persisted identifier of the last connected bottle.
pub trait DeviceRegistry: Send {
    fn last_known(&self) -> Option<DeviceId>;

    fn remember(&mut self, device: &DeviceId) -> Result<()>;
}

/// Collaborator set handed to the engine.
pub struct Collaborators {
    pub storage: Box<dyn Storage>,
    pub health: Box<dyn HealthMirror>,
    pub companion: Box<dyn CompanionSync>,
    pub registry: Box<dyn DeviceRegistry>,
}

/// Health mirror for platforms without one.
#[derive(Debug, Default)]
pub struct NoHealthMirror;

impl HealthMirror for NoHealthMirror {
    fn is_enabled(&self) -> bool {
        false
    }

    fn is_authorized(&self) -> bool {
        false
    }

    fn log_sample(&mut self, _amount_ml: u16, _at: DateTime<Utc>) -> Result<String> {
        Err(anyhow!("no health platform available"))
    }

    fn delete_sample(&mut self, _external_id: &str) -> Result<()> {
        Err(anyhow!("no health platform available"))
    }
}

/// Companion sync that only logs the snapshot.
#[derive(Debug, Default)]
pub struct LogCompanion;

impl CompanionSync for LogCompanion {
    fn push(&mut self, snapshot: &HydrationSnapshot) {
        debug!(
            "Companion: {} / {} ml, bottle {} ml, battery {}%",
            snapshot.daily_total_ml,
            snapshot.daily_goal_ml,
            snapshot.bottle_level_ml,
            snapshot.battery_percent
        );
    }
}

/// Reminder scheduler that logs instead of notifying.
#[derive(Debug, Default)]
pub struct LogReminders;

impl ReminderScheduler for LogReminders {
    fn schedule_reminder(&mut self, urgency: ReminderUrgency, deficit_ml: u16) {
        info!("Reminder ({:?}): {} ml to go today", urgency, deficit_ml);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deficit() {
        let snapshot = HydrationSnapshot {
            timestamp_sec: 0,
            daily_total_ml: 900,
            daily_goal_ml: 2000,
            bottle_level_ml: 300,
            battery_percent: 80,
        };
        assert_eq!(snapshot.deficit_ml(), 1100);

        let done = HydrationSnapshot {
            daily_total_ml: 2500,
            ..snapshot
        };
        assert_eq!(done.deficit_ml(), 0);
    }

    #[test]
    fn test_urgency_for_deficit() {
        assert_eq!(ReminderUrgency::for_deficit(0, 2000), None);
        assert_eq!(
            ReminderUrgency::for_deficit(1500, 2000),
            Some(ReminderUrgency::Urgent)
        );
        assert_eq!(
            ReminderUrgency::for_deficit(800, 2000),
            Some(ReminderUrgency::Firm)
        );
        assert_eq!(
            ReminderUrgency::for_deficit(200, 2000),
            Some(ReminderUrgency::Gentle)
        );
    }
}
