//! SQLite-backed alarm store.
//!
//! One row per alarm definition. The definition itself is stored as JSON so
//! new optional fields do not need a schema migration; `hour`, `minute` and
//! `active` are duplicated into columns for listing order and ad-hoc queries.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::data_dir;
use crate::alarm::AlarmDefinition;
use crate::engine::AlarmStore;
use crate::error::{CoreError, StoreError};

/// Persistent alarm definitions at `~/.config/chronos/chronos.db`.
pub struct AlarmDatabase {
    conn: Mutex<Connection>,
}

impl AlarmDatabase {
    /// Open the database in the data directory.
    ///
    /// Creates the database file and schema if they don't exist.
    ///
    /// # Errors
    /// Returns an error if the data directory is unavailable or the database
    /// cannot be opened or migrated.
    pub fn open() -> Result<Self, CoreError> {
        let path = data_dir()?.join("chronos.db");
        Ok(Self::open_path(&path)?)
    }

    pub fn open_path(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|source| StoreError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::with_connection(conn)
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn migrate(&self) -> Result<(), rusqlite::Error> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS alarms (
                id          TEXT PRIMARY KEY,
                hour        INTEGER NOT NULL,
                minute      INTEGER NOT NULL,
                active      INTEGER NOT NULL,
                definition  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alarms_time ON alarms(hour, minute);",
        )
    }

    fn decode(id: String, json: &str) -> Result<AlarmDefinition, StoreError> {
        serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
            id,
            message: e.to_string(),
        })
    }
}

impl AlarmStore for AlarmDatabase {
    /// Every row that decodes. A corrupt row is logged and skipped so the
    /// rest of the schedule keeps firing; `get` still reports it.
    fn list(&self) -> Result<Vec<AlarmDefinition>, StoreError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT id, definition FROM alarms ORDER BY hour, minute, id")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut alarms = Vec::new();
        for row in rows {
            let (id, json) = row?;
            match Self::decode(id, &json) {
                Ok(def) => alarms.push(def),
                Err(e) => warn!(error = %e, "skipping unreadable alarm record"),
            }
        }
        Ok(alarms)
    }

    fn get(&self, id: &str) -> Result<Option<AlarmDefinition>, StoreError> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT definition FROM alarms WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| Self::decode(id.to_string(), &j)).transpose()
    }

    fn upsert(&self, def: &AlarmDefinition) -> Result<(), StoreError> {
        let json = serde_json::to_string(def).map_err(|e| StoreError::Corrupt {
            id: def.id.clone(),
            message: e.to_string(),
        })?;
        self.conn().execute(
            "INSERT INTO alarms (id, hour, minute, active, definition, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                hour = excluded.hour,
                minute = excluded.minute,
                active = excluded.active,
                definition = excluded.definition,
                updated_at = excluded.updated_at",
            params![
                def.id,
                def.hour,
                def.minute,
                def.active,
                json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let n = self
            .conn()
            .execute("DELETE FROM alarms WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::{ChallengeKind, ChallengeSpec, DaySet, WakeUpCheckSpec};

    fn sample(hour: u32) -> AlarmDefinition {
        let mut def = AlarmDefinition::new(hour, 30, DaySet::from_indices(&[1, 3, 5]).unwrap())
            .unwrap();
        def.label = "Gym".into();
        def.challenges = vec![ChallengeSpec::new(ChallengeKind::Memory)];
        def.wake_up_check = Some(WakeUpCheckSpec {
            enabled: true,
            check_delay: 5,
            confirm_window: 1,
        });
        def
    }

    #[test]
    fn upsert_get_list_delete() {
        let db = AlarmDatabase::open_memory().unwrap();
        let late = sample(9);
        let early = sample(6);
        db.upsert(&late).unwrap();
        db.upsert(&early).unwrap();

        assert_eq!(db.get(&late.id).unwrap().as_ref(), Some(&late));
        let listed = db.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, early.id);

        assert!(db.delete(&late.id).unwrap());
        assert!(!db.delete(&late.id).unwrap());
        assert!(db.get(&late.id).unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let db = AlarmDatabase::open_memory().unwrap();
        let mut def = sample(7);
        db.upsert(&def).unwrap();
        def.active = false;
        def.minute = 45;
        db.upsert(&def).unwrap();

        let listed = db.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(!listed[0].active);
        assert_eq!(listed[0].minute, 45);
    }

    #[test]
    fn corrupt_row_is_reported() {
        let db = AlarmDatabase::open_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO alarms (id, hour, minute, active, definition, updated_at)
                 VALUES ('bad', 7, 0, 1, '{not json', '')",
                [],
            )
            .unwrap();
        assert!(matches!(db.get("bad"), Err(StoreError::Corrupt { .. })));
        assert!(db.list().unwrap().is_empty());
    }

    #[test]
    fn corrupt_row_does_not_silence_other_alarms() {
        use crate::engine::{AlarmEngine, Collaborators};
        use crate::events::Event;
        use crate::storage::EngineSettings;
        use crate::testing::{monday_at as at, Fakes};
        use std::sync::Arc;

        let db = AlarmDatabase::open_memory().unwrap();
        let good = AlarmDefinition::new(7, 0, DaySet::EMPTY).unwrap();
        db.upsert(&good).unwrap();
        db.conn()
            .execute(
                "INSERT INTO alarms (id, hour, minute, active, definition, updated_at)
                 VALUES ('bad', 7, 0, 1, '{oops', '')",
                [],
            )
            .unwrap();
        assert_eq!(db.list().unwrap(), vec![good.clone()]);

        let fakes = Fakes::new();
        let collaborators = Collaborators {
            store: Arc::new(db),
            ..fakes.collaborators()
        };
        let mut engine = AlarmEngine::new(collaborators, &EngineSettings::default());
        let events = engine.tick(at(7, 0, 0));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::AlarmFired { alarm_id, .. } if *alarm_id == good.id)));
        assert_eq!(fakes.audio.plays().len(), 1);
    }

    #[test]
    fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.db");
        let def = sample(7);
        {
            let db = AlarmDatabase::open_path(&path).unwrap();
            db.upsert(&def).unwrap();
        }
        let db = AlarmDatabase::open_path(&path).unwrap();
        assert_eq!(db.get(&def.id).unwrap(), Some(def));
    }
}
