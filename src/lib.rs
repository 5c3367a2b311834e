pub mod adapters;
pub mod config;
pub mod db;
pub mod distance;
pub mod engine;
pub mod errors;
pub mod lifecycle;
pub mod mirror;
pub mod models;
pub mod pipeline;
pub mod position;
pub mod retry;
pub mod session;

pub use crate::config::EngineSettings;
pub use crate::engine::{Collaborators, EngineHandle, LifecycleCommand};
pub use crate::errors::{AppError, AppResult};
pub use crate::session::CollectorRuntime;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Prepares the app data directory, logging and the runtime. Call once per
/// process from inside a tokio runtime.
pub fn setup(app_data_dir: &Path) -> AppResult<CollectorRuntime> {
    std::fs::create_dir_all(app_data_dir)?;
    init_tracing(app_data_dir)?;
    CollectorRuntime::new(app_data_dir)
}

pub fn init_tracing(app_data_dir: &Path) -> AppResult<()> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "collector.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
