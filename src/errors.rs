use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFIG_INVALID: {0}")]
    Config(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("ENGINE_CLOSED: {0}")]
    Closed(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Config(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Config(format!("{value:#}"))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failure reported by the remote request store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("STORE_TRANSIENT: {0}")]
    Transient(String),
    #[error("STORE_REJECTED: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure reported by the device location service.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("LOCATION_PERMISSION_DENIED")]
    PermissionDenied,
    #[error("LOCATION_UNAVAILABLE")]
    PositionUnavailable,
    #[error("LOCATION_TIMEOUT")]
    Timeout,
}

impl LocationError {
    /// Unavailable and timeout failures earn one relaxed retry; denial never does.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::PositionUnavailable | Self::Timeout)
    }
}
