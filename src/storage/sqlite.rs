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

//! Drink history storage using SQLite.

use anyhow::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bluetooth::protocol::{DrinkRecord, RecordFlags};
use crate::bluetooth::DeviceId;
use crate::collaborators::Storage;

/// Drink history database.
#[derive(Clone)]
pub struct DrinkHistory {
    conn: Arc<Mutex<Connection>>,
}

impl DrinkHistory {
    /// Create or open the history database in `data_dir`.
    pub fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("drinks.db");
        info!("Opening drink history: {:?}", db_path);

        Self::with_connection(Connection::open(&db_path)?)
    }

    /// In-memory database, for tests and dry runs.
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS drinks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                record_id INTEGER NOT NULL,
                timestamp INTEGER NOT NULL,
                amount_ml INTEGER NOT NULL,
                bottle_level_ml INTEGER NOT NULL,
                drink_type INTEGER NOT NULL,
                flags INTEGER NOT NULL,
                health_sample_id TEXT,
                UNIQUE(device_id, record_id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_drinks_timestamp ON drinks(timestamp DESC)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<DrinkRecord> {
    Ok(DrinkRecord {
        record_id: row.get(0)?,
        timestamp_sec: row.get(1)?,
        amount_ml: row.get(2)?,
        bottle_level_ml: row.get(3)?,
        drink_type: row.get(4)?,
        flags: RecordFlags(row.get(5)?),
    })
}

impl Storage for DrinkHistory {
    fn persist(&mut self, records: &[DrinkRecord], device: &DeviceId) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut inserted = 0;
        for record in records.iter().filter(|r| !r.is_deleted()) {
            inserted += tx.execute(
                "INSERT OR IGNORE INTO drinks
                 (device_id, record_id, timestamp, amount_ml, bottle_level_ml, drink_type, flags)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    device.as_str(),
                    record.record_id,
                    record.timestamp_sec,
                    record.amount_ml,
                    record.bottle_level_ml,
                    record.drink_type,
                    record.flags.0,
                ],
            )?;
        }
        tx.commit()?;

        debug!(
            "Stored {} of {} records from {}",
            inserted,
            records.len(),
            device
        );
        Ok(())
    }

    fn unsynced_records(&self) -> Result<Vec<DrinkRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT record_id, timestamp, amount_ml, bottle_level_ml, drink_type, flags
             FROM drinks
             WHERE health_sample_id IS NULL AND amount_ml > 0
             ORDER BY timestamp ASC, id ASC",
        )?;

        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn link_health_sample(&mut self, device_record_id: u32, external_id: &str) -> Result<()> {
        self.conn.lock().execute(
            "UPDATE drinks SET health_sample_id = ?1 WHERE record_id = ?2",
            params![external_id, device_record_id],
        )?;
        Ok(())
    }

    fn delete_record(&mut self, id: i64) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let sample: Option<Option<String>> = conn
            .query_row(
                "SELECT health_sample_id FROM drinks WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute("DELETE FROM drinks WHERE id = ?1", [id])?;
        Ok(sample.flatten())
    }

    fn lookup_record_id(&self, device_record_id: u32) -> Result<Option<i64>> {
        let id = self
            .conn
            .lock()
            .query_row(
                "SELECT id FROM drinks WHERE record_id = ?1 ORDER BY id DESC LIMIT 1",
                [device_record_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn drink(record_id: u32, timestamp_sec: u32, amount_ml: i16) -> DrinkRecord {
        DrinkRecord {
            record_id,
            timestamp_sec,
            amount_ml,
            bottle_level_ml: 500,
            drink_type: 0,
            flags: RecordFlags::default(),
        }
    }

    fn bottle() -> DeviceId {
        DeviceId::new("C0:FF:EE:00:00:01")
    }

    #[test]
    fn test_persist_ignores_duplicates_and_deleted() {
        let mut history = DrinkHistory::in_memory().unwrap();
        let deleted = DrinkRecord {
            flags: RecordFlags(RecordFlags::DELETED),
            ..drink(3, 1_700_000_200, 50)
        };

        history
            .persist(&[drink(1, 1_700_000_000, 200), deleted], &bottle())
            .unwrap();
        history
            .persist(&[drink(1, 1_700_000_000, 200), drink(2, 1_700_000_100, 150)], &bottle())
            .unwrap();

        let stored = history.unsynced_records().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].record_id, 1);
        assert_eq!(stored[1].record_id, 2);
        assert_eq!(history.lookup_record_id(3).unwrap(), None);
    }

    #[test]
    fn test_health_link_and_delete() {
        let mut history = DrinkHistory::in_memory().unwrap();
        history
            .persist(&[drink(7, 1_700_000_000, 250), drink(8, 1_700_000_060, 100)], &bottle())
            .unwrap();
        assert_eq!(history.unsynced_records().unwrap().len(), 2);

        history.link_health_sample(7, "sample-7").unwrap();
        let unsynced = history.unsynced_records().unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].record_id, 8);

        let local = history.lookup_record_id(7).unwrap().unwrap();
        assert_eq!(
            history.delete_record(local).unwrap(),
            Some("sample-7".to_string())
        );
        assert_eq!(history.lookup_record_id(7).unwrap(), None);

        let other = history.lookup_record_id(8).unwrap().unwrap();
        assert_eq!(history.delete_record(other).unwrap(), None);
        assert_eq!(history.delete_record(other).unwrap(), None);
    }

    #[test]
    fn test_refills_are_never_unsynced() {
        let mut history = DrinkHistory::in_memory().unwrap();
        history
            .persist(
                &[
                    drink(1, 1_700_000_000, 300),
                    drink(2, 1_700_001_000, -600),
                    drink(3, 1_700_002_000, 200),
                ],
                &bottle(),
            )
            .unwrap();

        // The refill is kept locally but never offered for mirroring
        assert!(history.lookup_record_id(2).unwrap().is_some());
        let ids: Vec<u32> = history
            .unsynced_records()
            .unwrap()
            .iter()
            .map(|r| r.record_id)
            .collect();
        assert_eq!(ids, vec![1, 3]);

        history.link_health_sample(1, "sample-1").unwrap();
        history.link_health_sample(3, "sample-3").unwrap();
        assert!(history.unsynced_records().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        {
            let mut history = DrinkHistory::new(dir.path()).unwrap();
            history
                .persist(&[drink(1, 1_700_000_000, 200)], &bottle())
                .unwrap();
        }
        let history = DrinkHistory::new(dir.path()).unwrap();
        assert_eq!(history.unsynced_records().unwrap().len(), 1);
    }
}
