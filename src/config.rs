use crate::models::{Coordinate, PositionOptions};
use crate::retry::RetryPolicy;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SETTINGS_FILE_NAME: &str = "collector.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Used before any cached or live position is known.
    pub fallback_coordinate: Coordinate,
    pub trustworthy_accuracy_m: f64,
    pub geofence_radius_m: f64,
    pub min_radius_km: f64,
    pub default_radius_km: f64,
    pub initial_location: PositionOptions,
    pub relaxed_location: PositionOptions,
    pub location_retry_delay_ms: u64,
    pub watch_location: PositionOptions,
    pub poll_interval_ms: u64,
    pub write_retry: RetryPolicy,
    pub feed_retry: RetryPolicy,
    /// Empty means any non-blank site is accepted.
    pub disposal_sites: Vec<String>,
    pub event_capacity: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            // Lagos city centre.
            fallback_coordinate: Coordinate::new(6.5244, 3.3792),
            trustworthy_accuracy_m: 50.0,
            geofence_radius_m: 50.0,
            min_radius_km: 10.0,
            default_radius_km: 15.0,
            initial_location: PositionOptions {
                high_accuracy: true,
                timeout_ms: 10_000,
                maximum_age_ms: 0,
            },
            relaxed_location: PositionOptions {
                high_accuracy: false,
                timeout_ms: 30_000,
                maximum_age_ms: 60_000,
            },
            location_retry_delay_ms: 2_000,
            watch_location: PositionOptions {
                high_accuracy: true,
                timeout_ms: 15_000,
                maximum_age_ms: 5_000,
            },
            poll_interval_ms: 30_000,
            write_retry: RetryPolicy::default(),
            feed_retry: RetryPolicy {
                max_attempts: 3,
                base_backoff_ms: 1_000,
                max_backoff_ms: 10_000,
                jitter_ms: 250,
            },
            disposal_sites: Vec::new(),
            event_capacity: 256,
        }
    }
}

impl EngineSettings {
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let settings: EngineSettings =
            serde_yaml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.fallback_coordinate.is_valid() {
            bail!("fallbackCoordinate is outside the valid latitude/longitude range");
        }
        if !(self.trustworthy_accuracy_m.is_finite() && self.trustworthy_accuracy_m > 0.0) {
            bail!("trustworthyAccuracyM must be a positive number");
        }
        if !(self.geofence_radius_m.is_finite() && self.geofence_radius_m > 0.0) {
            bail!("geofenceRadiusM must be a positive number");
        }
        if !(self.min_radius_km.is_finite() && self.min_radius_km > 0.0) {
            bail!("minRadiusKm must be a positive number");
        }
        if !self.default_radius_km.is_finite() || self.default_radius_km < self.min_radius_km {
            bail!(
                "defaultRadiusKm ({}) must be at least minRadiusKm ({})",
                self.default_radius_km,
                self.min_radius_km
            );
        }
        if self.poll_interval_ms == 0 {
            bail!("pollIntervalMs must be greater than zero");
        }
        if self.write_retry.max_attempts == 0 || self.feed_retry.max_attempts == 0 {
            bail!("retry policies need at least one attempt");
        }
        if self.event_capacity == 0 {
            bail!("eventCapacity must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::EngineSettings;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        EngineSettings::default().validate().expect("defaults validate");
    }

    #[test]
    fn partial_yaml_keeps_defaults_for_missing_keys() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "geofenceRadiusM: 75\nminRadiusKm: 12\ndefaultRadiusKm: 20").expect("write yaml");

        let settings = EngineSettings::load_from(file.path()).expect("load settings");
        assert_eq!(settings.geofence_radius_m, 75.0);
        assert_eq!(settings.min_radius_km, 12.0);
        assert_eq!(settings.trustworthy_accuracy_m, 50.0);
    }

    #[test]
    fn default_radius_below_floor_is_rejected() {
        let settings = EngineSettings {
            min_radius_km: 10.0,
            default_radius_km: 5.0,
            ..EngineSettings::default()
        };
        let error = settings.validate().expect_err("should reject");
        assert!(error.to_string().contains("defaultRadiusKm"));
    }

    #[test]
    fn invalid_fallback_coordinate_is_rejected() {
        let mut settings = EngineSettings::default();
        settings.fallback_coordinate.latitude = 120.0;
        assert!(settings.validate().is_err());
    }
}
