use crate::adapters::KeyValueStore;
use crate::config::EngineSettings;
use crate::errors::{AppError, AppResult};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const ENGINE_SETTINGS_KEY: &str = "engine";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };
        db.ensure_default_settings()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn get_settings(&self) -> AppResult<EngineSettings> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [ENGINE_SETTINGS_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(EngineSettings::default());
        };
        match serde_json::from_str::<EngineSettings>(&raw) {
            Ok(settings) => Ok(settings),
            Err(error) => {
                tracing::warn!(error = %error, "stored engine settings unreadable, using defaults");
                Ok(EngineSettings::default())
            }
        }
    }

    /// Merges a partial JSON document into the stored settings. The merged
    /// result must still validate.
    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<EngineSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: EngineSettings =
            serde_json::from_value(merged).map_err(|error| AppError::Config(error.to_string()))?;
        settings.validate()?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![
                ENGINE_SETTINGS_KEY,
                serde_json::to_string(&settings)?,
                Utc::now().to_rfc3339()
            ],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            [ENGINE_SETTINGS_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    ENGINE_SETTINGS_KEY,
                    serde_json::to_string(&EngineSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }
}

impl KeyValueStore for Database {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM key_values WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO key_values (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::adapters::KeyValueStore;
    use crate::config::EngineSettings;
    use crate::errors::AppError;
    use serde_json::json;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = Database::new(&dir.path().join("nested").join("state.sqlite")).expect("open database");
        (dir, db)
    }

    #[test]
    fn fresh_database_has_default_settings() {
        let (_dir, db) = open();
        assert_eq!(db.get_settings().expect("settings"), EngineSettings::default());
    }

    #[test]
    fn nested_update_keeps_sibling_fields() {
        let (_dir, db) = open();
        let updated = db
            .update_settings(json!({
                "geofenceRadiusM": 30.0,
                "writeRetry": { "maxAttempts": 6 },
                "disposalSites": ["Olusosun", "Epe"]
            }))
            .expect("update settings");

        assert_eq!(updated.geofence_radius_m, 30.0);
        assert_eq!(updated.write_retry.max_attempts, 6);
        assert_eq!(updated.write_retry.base_backoff_ms, EngineSettings::default().write_retry.base_backoff_ms);
        assert_eq!(db.get_settings().expect("reload"), updated);
    }

    #[test]
    fn invalid_update_is_rejected_and_not_stored() {
        let (_dir, db) = open();
        let error = db
            .update_settings(json!({ "defaultRadiusKm": 1.0 }))
            .expect_err("below floor");
        assert!(matches!(error, AppError::Config(_)));
        assert_eq!(db.get_settings().expect("settings"), EngineSettings::default());
    }

    #[test]
    fn key_values_overwrite_wholesale() {
        let (_dir, db) = open();
        assert_eq!(db.get("last_known_position").expect("get"), None);
        db.set("last_known_position", "{\"a\":1}").expect("set");
        db.set("last_known_position", "{\"b\":2}").expect("overwrite");
        assert_eq!(db.get("last_known_position").expect("get"), Some("{\"b\":2}".to_string()));
    }

    #[test]
    fn settings_survive_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state.sqlite");
        {
            let db = Database::new(&path).expect("open");
            db.update_settings(json!({ "pollIntervalMs": 5000 })).expect("update");
        }
        let db = Database::new(&path).expect("reopen");
        assert_eq!(db.get_settings().expect("settings").poll_interval_ms, 5000);
    }
}
