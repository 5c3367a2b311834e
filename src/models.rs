use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(RequestId);
id_newtype!(CollectorId);

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PositionSource {
    Fallback,
    Cached,
    Live,
}

impl PositionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fallback => "fallback",
            Self::Cached => "cached",
            Self::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionState {
    Unknown,
    Granted,
    Denied,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReading {
    pub coordinate: Coordinate,
    pub source: PositionSource,
    /// Only live readings carry accuracy.
    pub accuracy_m: Option<f64>,
    pub recorded_at: DateTime<Utc>,
}

impl PositionReading {
    pub fn is_trustworthy(&self, max_accuracy_m: f64) -> bool {
        self.source == PositionSource::Live
            && self
                .accuracy_m
                .map(|accuracy| accuracy <= max_accuracy_m)
                .unwrap_or(false)
    }
}

/// What the UI reads to render the position badge and advisory banner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSnapshot {
    pub reading: PositionReading,
    pub permission: PermissionState,
}

/// A raw fix reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceFix {
    pub coordinate: Coordinate,
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout_ms: u64,
    pub maximum_age_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WasteCategory {
    Plastic,
    Paper,
    Glass,
    Metal,
    Organic,
    Electronic,
    Textile,
    Hazardous,
    Mixed,
    #[serde(other)]
    Other,
}

impl WasteCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plastic => "plastic",
            Self::Paper => "paper",
            Self::Glass => "glass",
            Self::Metal => "metal",
            Self::Organic => "organic",
            Self::Electronic => "electronic",
            Self::Textile => "textile",
            Self::Hazardous => "hazardous",
            Self::Mixed => "mixed",
            Self::Other => "other",
        }
    }
}

impl FromStr for WasteCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "plastic" => Ok(Self::Plastic),
            "paper" | "cardboard" => Ok(Self::Paper),
            "glass" => Ok(Self::Glass),
            "metal" => Ok(Self::Metal),
            "organic" => Ok(Self::Organic),
            "electronic" | "e-waste" => Ok(Self::Electronic),
            "textile" => Ok(Self::Textile),
            "hazardous" => Ok(Self::Hazardous),
            "mixed" | "general" => Ok(Self::Mixed),
            "other" => Ok(Self::Other),
            other => Err(format!("unknown waste category '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
    Available,
    Accepted,
    Completed,
    Disposed,
}

impl RequestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Accepted => "accepted",
            Self::Completed => "completed",
            Self::Disposed => "disposed",
        }
    }

    /// The single forward step a collector may take from this status.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Available => Some(Self::Accepted),
            Self::Accepted => Some(Self::Completed),
            Self::Completed => Some(Self::Disposed),
            Self::Disposed => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub waste_category: WasteCategory,
    /// Remote records occasionally arrive without a usable location.
    pub coordinate: Option<Coordinate>,
    pub human_location: String,
    pub fee_amount: f64,
    pub priority: Priority,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_collector: Option<CollectorId>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disposed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub disposal_site: Option<String>,
}

impl Request {
    pub fn valid_coordinate(&self) -> Option<Coordinate> {
        self.coordinate.filter(Coordinate::is_valid)
    }
}

/// One row of the worker-visible list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibleRequest {
    pub request: Request,
    pub distance_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityFilter {
    All,
    Low,
    Medium,
    High,
}

impl PriorityFilter {
    pub fn admits(self, priority: Priority) -> bool {
        match self {
            Self::All => true,
            Self::Low => priority == Priority::Low,
            Self::Medium => priority == Priority::Medium,
            Self::High => priority == Priority::High,
        }
    }
}

/// Fully specified filter value. Build it from [`FilterCriteriaInput`] at the
/// boundary so that defaults and the radius floor are applied exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteria {
    pub radius_km: f64,
    /// Empty means every category.
    pub waste_categories: BTreeSet<WasteCategory>,
    pub min_fee: f64,
    pub priority: PriorityFilter,
    pub collector_online: bool,
}

/// Partially shaped criteria as sent by the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteriaInput {
    pub radius_km: Option<f64>,
    /// Category names; `"all"` anywhere in the list lifts the restriction.
    pub waste_categories: Option<Vec<String>>,
    pub min_fee: Option<f64>,
    pub priority: Option<PriorityFilter>,
    pub collector_online: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityScope {
    pub collector_id: CollectorId,
    pub status: RequestStatus,
}

impl VisibilityScope {
    pub fn available_for(collector_id: &CollectorId) -> Self {
        Self {
            collector_id: collector_id.clone(),
            status: RequestStatus::Available,
        }
    }

    /// Requests in `status` held by the collector.
    pub fn assigned_to(collector_id: &CollectorId, status: RequestStatus) -> Self {
        Self {
            collector_id: collector_id.clone(),
            status,
        }
    }
}

/// One record change from the remote live feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ChangeEvent {
    Insert { record: Request },
    Update { record: Request },
    Delete { id: RequestId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusStamp {
    pub at: DateTime<Utc>,
    pub disposal_site: Option<String>,
    pub position: Option<Coordinate>,
}

/// Status-guarded conditional write sent to the request store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusWrite {
    pub request_id: RequestId,
    pub collector_id: CollectorId,
    pub expected: RequestStatus,
    pub next: RequestStatus,
    pub stamp: StatusStamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum WriteOutcome {
    Applied { record: Request },
    /// The guard failed. `current` is the record as the store holds it now.
    Conflict { current: Option<Request> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum RefusalReason {
    NotFound,
    /// Another write for the same request has not settled yet.
    WriteInFlight,
    InvalidStatus {
        current: RequestStatus,
        required: RequestStatus,
    },
    CollectorOffline,
    PositionNotTrusted {
        source: PositionSource,
        accuracy_m: Option<f64>,
    },
    TooFar {
        distance_m: f64,
        limit_m: f64,
    },
    RequestLocationUnknown,
    MissingDisposalSite,
    UnknownDisposalSite {
        site: String,
    },
}

impl RefusalReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "REQUEST_NOT_FOUND",
            Self::WriteInFlight => "WRITE_IN_FLIGHT",
            Self::InvalidStatus { .. } => "INVALID_STATUS",
            Self::CollectorOffline => "COLLECTOR_OFFLINE",
            Self::PositionNotTrusted { .. } => "POSITION_NOT_TRUSTED",
            Self::TooFar { .. } => "TOO_FAR",
            Self::RequestLocationUnknown => "REQUEST_LOCATION_UNKNOWN",
            Self::MissingDisposalSite => "DISPOSAL_SITE_REQUIRED",
            Self::UnknownDisposalSite { .. } => "DISPOSAL_SITE_UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReason {
    pub code: String,
    pub attempts: u32,
    pub message: String,
}

/// Result of a lifecycle command as seen by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum LifecycleOutcome {
    Success { request: Request },
    Conflict {
        request_id: RequestId,
        current: Option<RequestStatus>,
    },
    Refused { reason: RefusalReason },
    Failed { reason: FailureReason },
}

impl LifecycleOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Conflict { .. } => "conflict",
            Self::Refused { .. } => "refused",
            Self::Failed { .. } => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    PositionUpgraded {
        source: PositionSource,
        accuracy_m: Option<f64>,
    },
    LowAccuracyDiscarded {
        accuracy_m: f64,
        kept: PositionSource,
    },
    PermissionDenied,
    LocationUnavailable {
        reason: String,
    },
    RequestClaimedElsewhere {
        request_id: RequestId,
    },
    RequestReleased {
        request_id: RequestId,
    },
    AssignmentReleased {
        request_id: RequestId,
    },
    MalformedRecordDiscarded {
        request_id: RequestId,
        reason: String,
    },
    FeedDegraded {
        message: String,
    },
    SyncFailed {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: EngineEvent,
}
