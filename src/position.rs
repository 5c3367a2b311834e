use crate::adapters::{KeyValueStore, LocationService};
use crate::config::EngineSettings;
use crate::errors::LocationError;
use crate::models::{
    Coordinate, DeviceFix, PermissionState, PositionReading, PositionSnapshot, PositionSource,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

pub const LAST_KNOWN_POSITION_KEY: &str = "last_known_position";

/// Shape of the last accepted reading in the key-value store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedPosition {
    pub coordinate: Coordinate,
    pub accuracy_m: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadingVerdict {
    /// First acceptable live reading; the source moved to `Live`.
    Upgraded,
    /// Already live; coordinate replaced.
    Updated,
    /// Too inaccurate to replace a fallback or cached position.
    Discarded { accuracy_m: f64 },
    Invalid,
}

impl ReadingVerdict {
    pub fn accepted(self) -> bool {
        matches!(self, Self::Upgraded | Self::Updated)
    }
}

/// Fallback -> Cached -> Live, gated on reported accuracy.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    current: PositionReading,
    permission: PermissionState,
    trustworthy_accuracy_m: f64,
}

impl PositionTracker {
    pub fn new(fallback: Coordinate, trustworthy_accuracy_m: f64) -> Self {
        Self {
            current: PositionReading {
                coordinate: fallback,
                source: PositionSource::Fallback,
                accuracy_m: None,
                recorded_at: Utc::now(),
            },
            permission: PermissionState::Unknown,
            trustworthy_accuracy_m,
        }
    }

    /// Starts from the persisted position when one exists.
    pub fn bootstrap(settings: &EngineSettings, cached: Option<PersistedPosition>) -> Self {
        let mut tracker = Self::new(settings.fallback_coordinate, settings.trustworthy_accuracy_m);
        if let Some(cached) = cached {
            tracker.restore_cached(cached);
        }
        tracker
    }

    pub fn restore_cached(&mut self, cached: PersistedPosition) -> bool {
        if self.current.source != PositionSource::Fallback || !cached.coordinate.is_valid() {
            return false;
        }
        self.current = PositionReading {
            coordinate: cached.coordinate,
            source: PositionSource::Cached,
            accuracy_m: None,
            recorded_at: cached.recorded_at,
        };
        true
    }

    pub fn observe(&mut self, fix: DeviceFix) -> ReadingVerdict {
        if !fix.coordinate.is_valid() || !fix.accuracy_m.is_finite() || fix.accuracy_m < 0.0 {
            return ReadingVerdict::Invalid;
        }
        self.permission = PermissionState::Granted;

        let verdict = match self.current.source {
            PositionSource::Live => ReadingVerdict::Updated,
            PositionSource::Fallback | PositionSource::Cached => {
                if fix.accuracy_m > self.trustworthy_accuracy_m {
                    return ReadingVerdict::Discarded {
                        accuracy_m: fix.accuracy_m,
                    };
                }
                ReadingVerdict::Upgraded
            }
        };

        self.current = PositionReading {
            coordinate: fix.coordinate,
            source: PositionSource::Live,
            accuracy_m: Some(fix.accuracy_m),
            recorded_at: fix.timestamp,
        };
        verdict
    }

    /// Failures never move the position; denial only raises the advisory.
    pub fn record_failure(&mut self, error: LocationError) {
        if error == LocationError::PermissionDenied {
            self.permission = PermissionState::Denied;
        }
    }

    pub fn reading(&self) -> PositionReading {
        self.current
    }

    pub fn source(&self) -> PositionSource {
        self.current.source
    }

    pub fn coordinate(&self) -> Coordinate {
        self.current.coordinate
    }

    pub fn permission(&self) -> PermissionState {
        self.permission
    }

    pub fn is_trustworthy(&self) -> bool {
        self.current.is_trustworthy(self.trustworthy_accuracy_m)
    }

    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            reading: self.current,
            permission: self.permission,
        }
    }

    pub fn persisted(&self) -> PersistedPosition {
        PersistedPosition {
            coordinate: self.current.coordinate,
            accuracy_m: self.current.accuracy_m,
            recorded_at: self.current.recorded_at,
        }
    }
}

pub fn load_last_known(store: &dyn KeyValueStore) -> Option<PersistedPosition> {
    let raw = match store.get(LAST_KNOWN_POSITION_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(error) => {
            tracing::warn!(error = %error, "failed to read last known position");
            return None;
        }
    };
    match serde_json::from_str::<PersistedPosition>(&raw) {
        Ok(position) if position.coordinate.is_valid() => Some(position),
        Ok(_) => {
            tracing::warn!("ignoring persisted position with out-of-range coordinate");
            None
        }
        Err(error) => {
            tracing::warn!(error = %error, "ignoring unreadable persisted position");
            None
        }
    }
}

pub fn save_last_known(store: &dyn KeyValueStore, position: &PersistedPosition) {
    let result = serde_json::to_string(position)
        .map_err(crate::errors::AppError::from)
        .and_then(|raw| store.set(LAST_KNOWN_POSITION_KEY, &raw));
    if let Err(error) = result {
        tracing::warn!(error = %error, "failed to persist last known position");
    }
}

/// Asks the device for a first fix, retrying once with relaxed options when
/// the position is unavailable or the request timed out.
pub async fn acquire_initial_fix(
    service: &dyn LocationService,
    settings: &EngineSettings,
) -> Result<DeviceFix, LocationError> {
    match service.current_position(settings.initial_location).await {
        Ok(fix) => Ok(fix),
        Err(error) if error.is_retryable() => {
            tracing::info!(error = %error, "initial fix failed, retrying with relaxed accuracy");
            tokio::time::sleep(Duration::from_millis(settings.location_retry_delay_ms)).await;
            service.current_position(settings.relaxed_location).await
        }
        Err(error) => Err(error),
    }
}
