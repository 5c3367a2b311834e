use crate::adapters::{FeedSubscription, KeyValueStore, RequestStore, SubscriptionId};
use crate::errors::{AppError, AppResult, StoreError};
use crate::models::{ChangeEvent, Request, RequestId, RequestStatus, StatusWrite, VisibilityScope, WriteOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// In-process request store with a live feed and status-guarded writes.
/// Good for local development and tests; nothing is durable.
#[derive(Default)]
pub struct InMemoryRequestStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<RequestId, Request>,
    subscribers: HashMap<SubscriptionId, mpsc::UnboundedSender<ChangeEvent>>,
    next_subscription: SubscriptionId,
    failing_queries: u32,
    failing_writes: u32,
    lost_acks: u32,
    refuse_subscriptions: bool,
    writes: Vec<StatusWrite>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = Request>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for record in records {
                inner.records.insert(record.id.clone(), record);
            }
        }
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test thread panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, id: &RequestId) -> Option<Request> {
        self.lock().records.get(id).cloned()
    }

    pub fn insert(&self, record: Request) {
        let mut inner = self.lock();
        inner.records.insert(record.id.clone(), record.clone());
        inner.broadcast(ChangeEvent::Insert { record });
    }

    /// Overwrites a record as if another client changed it.
    pub fn update(&self, record: Request) {
        let mut inner = self.lock();
        inner.records.insert(record.id.clone(), record.clone());
        inner.broadcast(ChangeEvent::Update { record });
    }

    pub fn delete(&self, id: &RequestId) {
        let mut inner = self.lock();
        inner.records.remove(id);
        inner.broadcast(ChangeEvent::Delete { id: id.clone() });
    }

    pub fn fail_next_queries(&self, count: u32) {
        self.lock().failing_queries = count;
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    /// The next `count` writes are applied but answered with a transient
    /// error, as when the reply is lost after the commit.
    pub fn lose_next_acks(&self, count: u32) {
        self.lock().lost_acks = count;
    }

    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.lock().refuse_subscriptions = refuse;
    }

    /// Drops every live feed, as a lost connection would.
    pub fn disconnect_feeds(&self) {
        self.lock().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn writes(&self) -> Vec<StatusWrite> {
        self.lock().writes.clone()
    }

    pub async fn wait_for_subscriber(&self) {
        while self.subscriber_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Inner {
    fn broadcast(&mut self, event: ChangeEvent) {
        self.subscribers
            .retain(|_, sender| sender.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn query_available(&self, scope: &VisibilityScope) -> Result<Vec<Request>, StoreError> {
        let mut inner = self.lock();
        if inner.failing_queries > 0 {
            inner.failing_queries -= 1;
            return Err(StoreError::Transient("query timed out".to_string()));
        }
        let mut records = inner
            .records
            .values()
            .filter(|record| record.status == scope.status)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn query_assigned(&self, scope: &VisibilityScope) -> Result<Vec<Request>, StoreError> {
        let inner = self.lock();
        let mut records = inner
            .records
            .values()
            .filter(|record| {
                record.status == scope.status && record.assigned_collector.as_ref() == Some(&scope.collector_id)
            })
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    async fn subscribe(&self, _scope: &VisibilityScope) -> Result<FeedSubscription, StoreError> {
        let mut inner = self.lock();
        if inner.refuse_subscriptions {
            return Err(StoreError::Transient("realtime channel refused".to_string()));
        }
        inner.next_subscription += 1;
        let id = inner.next_subscription;
        let (sender, events) = mpsc::unbounded_channel();
        inner.subscribers.insert(id, sender);
        Ok(FeedSubscription { id, events })
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.lock().subscribers.remove(&id);
    }

    async fn write_status(&self, write: &StatusWrite) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.lock();
        if inner.failing_writes > 0 {
            inner.failing_writes -= 1;
            return Err(StoreError::Transient("write timed out".to_string()));
        }
        inner.writes.push(write.clone());

        let Some(current) = inner.records.get(&write.request_id) else {
            return Ok(WriteOutcome::Conflict { current: None });
        };
        if current.status != write.expected {
            return Ok(WriteOutcome::Conflict {
                current: Some(current.clone()),
            });
        }
        if write.expected != RequestStatus::Available
            && current.assigned_collector.as_ref() != Some(&write.collector_id)
        {
            return Ok(WriteOutcome::Conflict {
                current: Some(current.clone()),
            });
        }

        let mut record = current.clone();
        record.status = write.next;
        match write.next {
            RequestStatus::Accepted => {
                record.accepted_at = Some(write.stamp.at);
                record.assigned_collector = Some(write.collector_id.clone());
            }
            RequestStatus::Completed => record.completed_at = Some(write.stamp.at),
            RequestStatus::Disposed => {
                record.disposed_at = Some(write.stamp.at);
                record.disposal_site = write.stamp.disposal_site.clone();
            }
            RequestStatus::Available => {
                record.assigned_collector = None;
                record.accepted_at = None;
            }
        }

        inner.records.insert(record.id.clone(), record.clone());
        inner.broadcast(ChangeEvent::Update {
            record: record.clone(),
        });
        if inner.lost_acks > 0 {
            inner.lost_acks -= 1;
            return Err(StoreError::Transient("reply lost after commit".to_string()));
        }
        Ok(WriteOutcome::Applied { record })
    }
}

/// Key-value store kept in memory, for sessions that should not touch disk.
#[derive(Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| AppError::Internal("key-value mutex poisoned".to_string()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| AppError::Internal("key-value mutex poisoned".to_string()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
