use crate::adapters::{KeyValueStore, LocationService, RequestStore};
use crate::config::{EngineSettings, SETTINGS_FILE_NAME};
use crate::db::Database;
use crate::engine::{self, Collaborators, EngineHandle};
use crate::errors::{AppError, AppResult};
use crate::models::CollectorId;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DATABASE_FILE_NAME: &str = "state.sqlite";

/// Process-level owner of the database, resolved settings and one engine per
/// signed-in collector.
#[derive(Clone)]
pub struct CollectorRuntime {
    app_data_dir: PathBuf,
    db: Arc<Database>,
    settings: EngineSettings,
    sessions: Arc<Mutex<HashMap<CollectorId, Arc<EngineHandle>>>>,
}

impl CollectorRuntime {
    pub fn new(app_data_dir: &Path) -> AppResult<Self> {
        fs::create_dir_all(app_data_dir).map_err(|err| AppError::Io(err.to_string()))?;
        let db = Arc::new(Database::new(&app_data_dir.join(DATABASE_FILE_NAME))?);
        let settings = resolve_settings(app_data_dir, &db)?;
        tracing::info!(
            app_data_dir = %app_data_dir.display(),
            geofence_radius_m = settings.geofence_radius_m,
            "collector runtime ready"
        );

        Ok(Self {
            app_data_dir: app_data_dir.to_path_buf(),
            db,
            settings,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn app_data_dir(&self) -> &Path {
        &self.app_data_dir
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn database(&self) -> Arc<Database> {
        Arc::clone(&self.db)
    }

    /// Starts an engine for the collector. A session already open for the
    /// same collector is shut down first.
    pub async fn open_session(
        &self,
        collector_id: CollectorId,
        location: Arc<dyn LocationService>,
        store: Arc<dyn RequestStore>,
    ) -> AppResult<Arc<EngineHandle>> {
        let key_values: Arc<dyn KeyValueStore> = self.db.clone();
        let handle = Arc::new(engine::start(
            collector_id.clone(),
            self.settings.clone(),
            Collaborators {
                location,
                store,
                key_values,
            },
        ));

        let previous = {
            let mut sessions = self.sessions.lock().await;
            sessions.insert(collector_id.clone(), Arc::clone(&handle))
        };
        if let Some(previous) = previous {
            tracing::info!(collector_id = %collector_id, "replacing existing collector session");
            previous.shutdown().await?;
        }
        Ok(handle)
    }

    pub async fn session(&self, collector_id: &CollectorId) -> Option<Arc<EngineHandle>> {
        let sessions = self.sessions.lock().await;
        sessions.get(collector_id).cloned()
    }

    pub async fn close_session(&self, collector_id: &CollectorId) -> AppResult<()> {
        let handle = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(collector_id)
        };
        let Some(handle) = handle else {
            return Err(AppError::NotFound(format!("No active session for collector {}", collector_id)));
        };
        handle.shutdown().await
    }

    pub async fn shutdown_all(&self) -> AppResult<()> {
        let handles = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, handle)| handle).collect::<Vec<_>>()
        };
        for handle in handles {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

/// A settings file next to the database wins over stored settings.
fn resolve_settings(app_data_dir: &Path, db: &Database) -> AppResult<EngineSettings> {
    let file = app_data_dir.join(SETTINGS_FILE_NAME);
    if file.is_file() {
        return Ok(EngineSettings::load_from(&file)?);
    }
    let settings = db.get_settings()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::CollectorRuntime;
    use crate::adapters::memory::InMemoryRequestStore;
    use crate::adapters::scripted::ScriptedLocationService;
    use crate::adapters::KeyValueStore;
    use crate::errors::AppError;
    use crate::models::{CollectorId, PositionSource};
    use crate::position::LAST_KNOWN_POSITION_KEY;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn yaml_file_overrides_stored_settings() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("collector.yaml"), "geofenceRadiusM: 25\n").expect("write yaml");

        let runtime = CollectorRuntime::new(dir.path()).expect("runtime");
        assert_eq!(runtime.settings().geofence_radius_m, 25.0);
    }

    #[tokio::test]
    async fn stored_settings_are_used_without_yaml() {
        let dir = tempfile::tempdir().expect("temp dir");
        {
            let runtime = CollectorRuntime::new(dir.path()).expect("runtime");
            runtime
                .database()
                .update_settings(json!({ "minRadiusKm": 5.0, "defaultRadiusKm": 8.0 }))
                .expect("update");
        }
        let runtime = CollectorRuntime::new(dir.path()).expect("reopen");
        assert_eq!(runtime.settings().default_radius_km, 8.0);
    }

    #[tokio::test]
    async fn session_bootstraps_from_persisted_position() {
        let dir = tempfile::tempdir().expect("temp dir");
        let runtime = CollectorRuntime::new(dir.path()).expect("runtime");
        runtime
            .database()
            .set(
                LAST_KNOWN_POSITION_KEY,
                r#"{"coordinate":{"latitude":6.6,"longitude":3.35},"accuracyM":12.0,"recordedAt":"2026-03-01T08:00:00Z"}"#,
            )
            .expect("seed position");

        let collector = CollectorId::new("c1");
        let handle = runtime
            .open_session(
                collector.clone(),
                Arc::new(ScriptedLocationService::new()),
                Arc::new(InMemoryRequestStore::new()),
            )
            .await
            .expect("open session");
        assert_eq!(handle.position_confidence(), PositionSource::Cached);
        assert!(runtime.session(&collector).await.is_some());

        runtime.close_session(&collector).await.expect("close");
        assert!(runtime.session(&collector).await.is_none());
        let error = runtime.close_session(&collector).await.expect_err("already closed");
        assert!(matches!(error, AppError::NotFound(_)));
    }
}
