//! SQLite-backed roster.
//!
//! One row per instance holding its config as JSON, plus a position column
//! that preserves insertion order across upserts.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use fleet_id::InstanceId;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{ConfigPatch, InstanceConfig, RosterError, RosterStore};

pub struct SqliteRoster {
    conn: Mutex<Connection>,
}

impl SqliteRoster {
    /// Open or create a roster at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RosterError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let roster = Self {
            conn: Mutex::new(conn),
        };
        roster.init_schema()?;
        Ok(roster)
    }

    /// Open an in-memory roster (for testing).
    pub fn open_in_memory() -> Result<Self, RosterError> {
        let roster = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        roster.init_schema()?;
        Ok(roster)
    }

    fn init_schema(&self) -> Result<(), RosterError> {
        self.lock().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                kind TEXT NOT NULL,
                config_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_instances_position ON instances(position);
            "#,
        )?;

        debug!("Roster schema initialized");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch one stored config.
    pub fn get_instance(&self, id: &InstanceId) -> Result<Option<InstanceConfig>, RosterError> {
        let json: Option<String> = self
            .lock()
            .query_row(
                "SELECT config_json FROM instances WHERE instance_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(Into::into)
    }

    pub fn count(&self) -> Result<i64, RosterError> {
        let count = self
            .lock()
            .query_row("SELECT COUNT(*) FROM instances", [], |row| row.get(0))?;
        Ok(count)
    }
}

impl RosterStore for SqliteRoster {
    fn load_roster(&self) -> Result<Vec<InstanceConfig>, RosterError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT config_json FROM instances ORDER BY position, created_at")?;

        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(RosterError::from))
            .collect()
    }

    fn upsert_instance(&self, config: &InstanceConfig) -> Result<(), RosterError> {
        let json = serde_json::to_string(config)?;
        let now = chrono::Utc::now().timestamp();

        self.lock().execute(
            r#"
            INSERT INTO instances (instance_id, position, kind, config_json, created_at, updated_at)
            VALUES (?1, (SELECT IFNULL(MAX(position), 0) + 1 FROM instances), ?2, ?3, ?4, ?4)
            ON CONFLICT(instance_id) DO UPDATE SET
                kind = excluded.kind,
                config_json = excluded.config_json,
                updated_at = excluded.updated_at
            "#,
            params![config.id.as_str(), config.kind.as_str(), json, now],
        )?;
        Ok(())
    }

    fn save_instance_config(
        &self,
        id: &InstanceId,
        patch: &ConfigPatch,
    ) -> Result<InstanceConfig, RosterError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let json: Option<String> = tx
            .query_row(
                "SELECT config_json FROM instances WHERE instance_id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(json) = json else {
            return Err(RosterError::NotFound(id.clone()));
        };

        let mut config: InstanceConfig = serde_json::from_str(&json)?;
        config.apply(patch);

        tx.execute(
            "UPDATE instances SET kind = ?1, config_json = ?2, updated_at = ?3 WHERE instance_id = ?4",
            params![
                config.kind.as_str(),
                serde_json::to_string(&config)?,
                chrono::Utc::now().timestamp(),
                id.as_str()
            ],
        )?;
        tx.commit()?;

        Ok(config)
    }

    fn remove_instance(&self, id: &InstanceId) -> Result<bool, RosterError> {
        let removed = self.lock().execute(
            "DELETE FROM instances WHERE instance_id = ?1",
            params![id.as_str()],
        )?;
        Ok(removed > 0)
    }
}
