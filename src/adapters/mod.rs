pub mod memory;
pub mod scripted;

use crate::errors::{AppResult, LocationError, StoreError};
use crate::models::{ChangeEvent, DeviceFix, PositionOptions, Request, StatusWrite, VisibilityScope, WriteOutcome};
use async_trait::async_trait;
use tokio::sync::mpsc;

pub type WatchId = u64;
pub type SubscriptionId = u64;

/// Continuous device updates. The stream ends when the watch is cleared.
pub struct PositionWatch {
    pub id: WatchId,
    pub updates: mpsc::UnboundedReceiver<Result<DeviceFix, LocationError>>,
}

/// Live change feed. A closed channel means the connection dropped.
pub struct FeedSubscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ChangeEvent>,
}

#[async_trait]
pub trait LocationService: Send + Sync {
    async fn current_position(&self, options: PositionOptions) -> Result<DeviceFix, LocationError>;
    async fn watch_position(&self, options: PositionOptions) -> Result<PositionWatch, LocationError>;
    fn clear_watch(&self, id: WatchId);
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn query_available(&self, scope: &VisibilityScope) -> Result<Vec<Request>, StoreError>;
    /// Requests in `scope.status` currently assigned to `scope.collector_id`.
    async fn query_assigned(&self, scope: &VisibilityScope) -> Result<Vec<Request>, StoreError>;
    async fn subscribe(&self, scope: &VisibilityScope) -> Result<FeedSubscription, StoreError>;
    async fn unsubscribe(&self, id: SubscriptionId);
    /// Applies the write only if the record is still in `write.expected`.
    async fn write_status(&self, write: &StatusWrite) -> Result<WriteOutcome, StoreError>;
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
}
