use crate::adapters::{KeyValueStore, LocationService, RequestStore, SubscriptionId, WatchId};
use crate::config::EngineSettings;
use crate::errors::{AppError, AppResult, LocationError};
use crate::lifecycle::{AssignmentViews, Assignments};
use crate::mirror::{MirrorChange, RemovalReason, RequestMirror};
use crate::models::{
    ChangeEvent, CollectorId, DeviceFix, EngineEvent, EventEnvelope, FilterCriteria, FilterCriteriaInput,
    LifecycleOutcome, PermissionState, PositionSnapshot, PositionSource, Request, RequestId, RequestStatus,
    StatusWrite, VisibilityScope, VisibleRequest, WriteOutcome,
};
use crate::pipeline::visible;
use crate::position::{acquire_initial_fix, load_last_known, save_last_known, PositionTracker, ReadingVerdict};
use crate::retry::{retry_with_backoff, RetryExhausted, RetryPolicy};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Duration;
use uuid::Uuid;

const MESSAGE_QUEUE_CAPACITY: usize = 256;

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub location: Arc<dyn LocationService>,
    pub store: Arc<dyn RequestStore>,
    pub key_values: Arc<dyn KeyValueStore>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleCommand {
    Accept { request_id: RequestId },
    Complete { request_id: RequestId },
    Dispose { request_id: RequestId, site: String },
}

enum EngineMessage {
    Fix(DeviceFix),
    LocationFailed(LocationError),
    WatchOpened(WatchId),
    FeedOpened(SubscriptionId),
    Feed(ChangeEvent),
    FeedLost {
        message: String,
    },
    Snapshot {
        requested_at: DateTime<Utc>,
        result: Result<Vec<Request>, RetryExhausted>,
    },
    /// Requests the store shows as already held by this collector.
    Held(Result<Vec<Request>, RetryExhausted>),
    Refresh,
    SetCriteria(FilterCriteriaInput),
    Command {
        command: LifecycleCommand,
        reply: oneshot::Sender<LifecycleOutcome>,
    },
    WriteSettled {
        write: StatusWrite,
        result: Result<WriteOutcome, RetryExhausted>,
        reply: oneshot::Sender<LifecycleOutcome>,
    },
    Shutdown(oneshot::Sender<()>),
}

type Outbox = mpsc::WeakSender<EngineMessage>;
type Reply = (oneshot::Sender<LifecycleOutcome>, LifecycleOutcome);

/// Starts one engine for a collector session. Must be called inside a tokio runtime.
pub fn start(collector_id: CollectorId, settings: EngineSettings, collaborators: Collaborators) -> EngineHandle {
    let tracker = PositionTracker::bootstrap(&settings, load_last_known(collaborators.key_values.as_ref()));
    let criteria = FilterCriteria::defaults(&settings);
    let scope = VisibilityScope::available_for(&collector_id);

    let (sender, receiver) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
    let (visible_tx, visible_rx) = watch::channel(Vec::new());
    let (position_tx, position_rx) = watch::channel(tracker.snapshot());
    let (assignments_tx, assignments_rx) = watch::channel(AssignmentViews::default());
    let (criteria_tx, criteria_rx) = watch::channel(criteria.clone());
    let (events, _) = broadcast::channel(settings.event_capacity.max(1));
    let outbox = sender.downgrade();

    tracing::info!(
        collector_id = %collector_id,
        source = tracker.source().as_str(),
        "starting collector engine"
    );

    let background = vec![
        tokio::spawn(track_location(
            Arc::clone(&collaborators.location),
            settings.clone(),
            outbox.clone(),
        )),
        tokio::spawn(sync_requests(
            Arc::clone(&collaborators.store),
            collector_id.clone(),
            scope.clone(),
            settings.clone(),
            outbox.clone(),
        )),
    ];

    let state = EngineState {
        collector_id: collector_id.clone(),
        scope,
        settings,
        collaborators,
        tracker,
        mirror: RequestMirror::new(),
        assignments: Assignments::new(),
        criteria,
        outbox,
        visible_tx,
        position_tx,
        assignments_tx,
        criteria_tx,
        events: events.clone(),
        seq: 0,
        watch_id: None,
        subscription_id: None,
        background,
        jobs: JoinSet::new(),
    };
    let task = tokio::spawn(state.run(receiver));

    EngineHandle {
        collector_id,
        sender,
        visible: visible_rx,
        position: position_rx,
        assignments: assignments_rx,
        criteria: criteria_rx,
        events,
        task: Mutex::new(Some(task)),
    }
}

/// The UI-facing side of a running engine. Reads are reactive `watch`
/// channels; commands go through the engine's message queue.
pub struct EngineHandle {
    collector_id: CollectorId,
    sender: mpsc::Sender<EngineMessage>,
    visible: watch::Receiver<Vec<VisibleRequest>>,
    position: watch::Receiver<PositionSnapshot>,
    assignments: watch::Receiver<AssignmentViews>,
    criteria: watch::Receiver<FilterCriteria>,
    events: broadcast::Sender<EventEnvelope>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EngineHandle {
    pub fn collector_id(&self) -> &CollectorId {
        &self.collector_id
    }

    pub fn visible_list(&self) -> Vec<VisibleRequest> {
        self.visible.borrow().clone()
    }

    pub fn subscribe_visible(&self) -> watch::Receiver<Vec<VisibleRequest>> {
        self.visible.clone()
    }

    pub fn position(&self) -> PositionSnapshot {
        *self.position.borrow()
    }

    pub fn position_confidence(&self) -> PositionSource {
        self.position.borrow().reading.source
    }

    pub fn subscribe_position(&self) -> watch::Receiver<PositionSnapshot> {
        self.position.clone()
    }

    pub fn filter_criteria(&self) -> FilterCriteria {
        self.criteria.borrow().clone()
    }

    pub fn accepted(&self) -> Vec<Request> {
        self.assignments.borrow().accepted.clone()
    }

    pub fn completed(&self) -> Vec<Request> {
        self.assignments.borrow().completed.clone()
    }

    pub fn disposed(&self) -> Vec<Request> {
        self.assignments.borrow().disposed.clone()
    }

    pub fn subscribe_assignments(&self) -> watch::Receiver<AssignmentViews> {
        self.assignments.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub async fn set_filter_criteria(&self, input: FilterCriteriaInput) -> AppResult<()> {
        self.send(EngineMessage::SetCriteria(input)).await
    }

    /// Re-queries the available pool, e.g. after a lost claim race.
    pub async fn refresh(&self) -> AppResult<()> {
        self.send(EngineMessage::Refresh).await
    }

    pub async fn accept(&self, request_id: &RequestId) -> AppResult<LifecycleOutcome> {
        self.command(LifecycleCommand::Accept {
            request_id: request_id.clone(),
        })
        .await
    }

    pub async fn complete(&self, request_id: &RequestId) -> AppResult<LifecycleOutcome> {
        self.command(LifecycleCommand::Complete {
            request_id: request_id.clone(),
        })
        .await
    }

    pub async fn dispose(&self, request_id: &RequestId, site: &str) -> AppResult<LifecycleOutcome> {
        self.command(LifecycleCommand::Dispose {
            request_id: request_id.clone(),
            site: site.to_string(),
        })
        .await
    }

    pub async fn command(&self, command: LifecycleCommand) -> AppResult<LifecycleOutcome> {
        let (reply, response) = oneshot::channel();
        self.send(EngineMessage::Command { command, reply }).await?;
        response
            .await
            .map_err(|_| AppError::Closed("engine stopped before the command settled".to_string()))
    }

    /// Tears down the feed, the location watch and every pending job.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) -> AppResult<()> {
        let task = self
            .task
            .lock()
            .map_err(|_| AppError::Internal("engine task mutex poisoned".to_string()))?
            .take();
        let Some(task) = task else {
            return Ok(());
        };

        let (ack, done) = oneshot::channel();
        if self.sender.send(EngineMessage::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
        task.await
            .map_err(|error| AppError::Internal(format!("engine task failed: {error}")))
    }

    async fn send(&self, message: EngineMessage) -> AppResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| AppError::Closed("engine is not running".to_string()))
    }
}

struct EngineState {
    collector_id: CollectorId,
    scope: VisibilityScope,
    settings: EngineSettings,
    collaborators: Collaborators,
    tracker: PositionTracker,
    mirror: RequestMirror,
    assignments: Assignments,
    criteria: FilterCriteria,
    outbox: Outbox,
    visible_tx: watch::Sender<Vec<VisibleRequest>>,
    position_tx: watch::Sender<PositionSnapshot>,
    assignments_tx: watch::Sender<AssignmentViews>,
    criteria_tx: watch::Sender<FilterCriteria>,
    events: broadcast::Sender<EventEnvelope>,
    seq: u64,
    watch_id: Option<WatchId>,
    subscription_id: Option<SubscriptionId>,
    background: Vec<JoinHandle<()>>,
    jobs: JoinSet<()>,
}

impl EngineState {
    async fn run(mut self, mut receiver: mpsc::Receiver<EngineMessage>) {
        let mut ack = None;
        while let Some(message) = receiver.recv().await {
            if let EngineMessage::Shutdown(reply) = message {
                ack = Some(reply);
                break;
            }
            let reply = self.handle(message);
            self.publish();
            // Callers observe the published views before their reply.
            if let Some((sender, outcome)) = reply {
                let _ = sender.send(outcome);
            }
            while self.jobs.try_join_next().is_some() {}
        }

        self.teardown(&mut receiver).await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn handle(&mut self, message: EngineMessage) -> Option<Reply> {
        match message {
            EngineMessage::Fix(fix) => self.on_fix(fix),
            EngineMessage::LocationFailed(error) => self.on_location_failure(error),
            EngineMessage::WatchOpened(id) => self.watch_id = Some(id),
            EngineMessage::FeedOpened(id) => {
                tracing::info!(subscription_id = id, "live feed connected");
                self.subscription_id = Some(id);
            }
            EngineMessage::Feed(event) => self.on_feed_event(event),
            EngineMessage::FeedLost { message } => {
                tracing::warn!(reason = %message, "live feed unavailable, polling instead");
                self.subscription_id = None;
                self.emit(EngineEvent::FeedDegraded { message });
            }
            EngineMessage::Snapshot { requested_at, result } => self.on_snapshot(requested_at, result),
            EngineMessage::Held(result) => self.on_held(result),
            EngineMessage::Refresh => self.spawn_refresh(),
            EngineMessage::SetCriteria(input) => {
                self.criteria = FilterCriteria::from_input(&input, &self.settings);
                tracing::info!(
                    radius_km = self.criteria.radius_km,
                    online = self.criteria.collector_online,
                    "filter criteria updated"
                );
            }
            EngineMessage::Command { command, reply } => return self.on_command(command, reply),
            EngineMessage::WriteSettled { write, result, reply } => {
                let outcome = self.assignments.settle(&mut self.mirror, &write, result);
                tracing::debug!(request_id = %write.request_id, outcome = outcome.tag(), "status write settled");
                if let LifecycleOutcome::Failed { reason } = &outcome {
                    tracing::warn!(
                        request_id = %write.request_id,
                        code = %reason.code,
                        attempts = reason.attempts,
                        "status write failed"
                    );
                }
                return Some((reply, outcome));
            }
            EngineMessage::Shutdown(_) => {}
        }
        None
    }

    fn on_fix(&mut self, fix: DeviceFix) {
        let kept = self.tracker.source();
        match self.tracker.observe(fix) {
            ReadingVerdict::Upgraded => {
                tracing::info!(accuracy_m = fix.accuracy_m, from = kept.as_str(), "live position acquired");
                save_last_known(self.collaborators.key_values.as_ref(), &self.tracker.persisted());
                self.emit(EngineEvent::PositionUpgraded {
                    source: PositionSource::Live,
                    accuracy_m: Some(fix.accuracy_m),
                });
            }
            ReadingVerdict::Updated => {
                save_last_known(self.collaborators.key_values.as_ref(), &self.tracker.persisted());
            }
            ReadingVerdict::Discarded { accuracy_m } => {
                tracing::info!(accuracy_m, kept = kept.as_str(), "low-accuracy fix discarded");
                self.emit(EngineEvent::LowAccuracyDiscarded { accuracy_m, kept });
            }
            ReadingVerdict::Invalid => {
                tracing::warn!(
                    latitude = fix.coordinate.latitude,
                    longitude = fix.coordinate.longitude,
                    accuracy_m = fix.accuracy_m,
                    "device reported an invalid fix"
                );
            }
        }
    }

    fn on_location_failure(&mut self, error: LocationError) {
        let previously = self.tracker.permission();
        self.tracker.record_failure(error);
        match error {
            LocationError::PermissionDenied => {
                if previously != PermissionState::Denied {
                    tracing::warn!("location permission denied");
                    self.emit(EngineEvent::PermissionDenied);
                }
            }
            LocationError::PositionUnavailable | LocationError::Timeout => {
                tracing::info!(error = %error, source = self.tracker.source().as_str(), "keeping current position");
                self.emit(EngineEvent::LocationUnavailable {
                    reason: error.to_string(),
                });
            }
        }
    }

    fn on_feed_event(&mut self, event: ChangeEvent) {
        let (returned_to_pool, released_own) = match &event {
            ChangeEvent::Update { record } if record.status == RequestStatus::Available => {
                (true, self.assignments.release(&record.id))
            }
            _ => (false, false),
        };
        let own_record = match &event {
            ChangeEvent::Update { record }
                if record.status != RequestStatus::Available
                    && record.assigned_collector.as_ref() == Some(&self.collector_id) =>
            {
                Some(record.clone())
            }
            _ => None,
        };
        let event_id = match &event {
            ChangeEvent::Insert { record } | ChangeEvent::Update { record } => record.id.clone(),
            ChangeEvent::Delete { id } => id.clone(),
        };

        if released_own {
            tracing::info!(request_id = %event_id, "own assignment released back to the pool");
            self.emit(EngineEvent::AssignmentReleased {
                request_id: event_id.clone(),
            });
        }

        match self.mirror.apply(event, &self.collector_id) {
            MirrorChange::Added(id) => {
                if returned_to_pool && !released_own {
                    self.emit(EngineEvent::RequestReleased { request_id: id });
                }
            }
            MirrorChange::Removed { id, reason } => match reason {
                RemovalReason::ClaimedElsewhere => {
                    tracing::info!(request_id = %id, "request claimed by another collector");
                    self.emit(EngineEvent::RequestClaimedElsewhere { request_id: id });
                }
                RemovalReason::ClaimedBySelf => {
                    tracing::debug!(request_id = %id, "own claim observed on feed");
                }
                RemovalReason::Deleted => {
                    tracing::debug!(request_id = %id, "request deleted");
                }
            },
            MirrorChange::Rejected { id, reason } => {
                tracing::warn!(request_id = %id, reason = %reason, "malformed record discarded");
                self.emit(EngineEvent::MalformedRecordDiscarded { request_id: id, reason });
            }
            MirrorChange::Refreshed(_) | MirrorChange::Unchanged => {}
        }

        if let Some(record) = own_record {
            if self.assignments.adopt(&mut self.mirror, record, &self.collector_id) {
                tracing::info!(request_id = %event_id, "own claim picked up from the feed");
            }
        }
    }

    fn on_snapshot(&mut self, requested_at: DateTime<Utc>, result: Result<Vec<Request>, RetryExhausted>) {
        let records = match result {
            Ok(records) => records,
            Err(exhausted) => {
                tracing::warn!(
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "available requests could not be fetched"
                );
                self.emit(EngineEvent::SyncFailed {
                    message: format!("{} after {} attempts", exhausted.last_error, exhausted.attempts),
                });
                return;
            }
        };

        let (kept, released) = self.assignments.screen_snapshot(records, requested_at);
        for request_id in released {
            tracing::info!(request_id = %request_id, "own assignment released back to the pool");
            self.emit(EngineEvent::AssignmentReleased { request_id });
        }

        let summary = self.mirror.resync(kept);
        if summary.mutated() {
            tracing::debug!(
                added = summary.added,
                removed = summary.removed,
                refreshed = summary.refreshed,
                total = self.mirror.len(),
                "mirror resynchronized"
            );
        }
        for id in summary.rejected {
            self.emit(EngineEvent::MalformedRecordDiscarded {
                request_id: id,
                reason: "missing or invalid fields in snapshot".to_string(),
            });
        }
    }

    fn on_held(&mut self, result: Result<Vec<Request>, RetryExhausted>) {
        let records = match result {
            Ok(records) => records,
            Err(exhausted) => {
                tracing::warn!(
                    attempts = exhausted.attempts,
                    error = %exhausted.last_error,
                    "held requests could not be fetched"
                );
                self.emit(EngineEvent::SyncFailed {
                    message: format!("{} after {} attempts", exhausted.last_error, exhausted.attempts),
                });
                return;
            }
        };

        let mut restored = 0usize;
        for record in records {
            if self.assignments.adopt(&mut self.mirror, record, &self.collector_id) {
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(collector_id = %self.collector_id, restored, "restored held requests");
        }
    }

    fn on_command(&mut self, command: LifecycleCommand, reply: oneshot::Sender<LifecycleOutcome>) -> Option<Reply> {
        let planned = match &command {
            LifecycleCommand::Accept { request_id } => self.assignments.plan_accept(
                &self.mirror,
                request_id,
                &self.collector_id,
                self.criteria.collector_online,
            ),
            LifecycleCommand::Complete { request_id } => self.assignments.plan_complete(
                &self.mirror,
                request_id,
                &self.collector_id,
                &self.tracker,
                self.settings.geofence_radius_m,
            ),
            LifecycleCommand::Dispose { request_id, site } => self.assignments.plan_dispose(
                &self.mirror,
                request_id,
                &self.collector_id,
                site,
                &self.settings.disposal_sites,
            ),
        };

        match planned {
            Ok(write) => {
                self.spawn_write(write, reply);
                None
            }
            Err(reason) => {
                tracing::info!(command = ?command, code = reason.code(), "command refused");
                Some((reply, LifecycleOutcome::Refused { reason }))
            }
        }
    }

    fn spawn_write(&mut self, write: StatusWrite, reply: oneshot::Sender<LifecycleOutcome>) {
        let store = Arc::clone(&self.collaborators.store);
        let policy = self.settings.write_retry;
        let outbox = self.outbox.clone();
        self.jobs.spawn(async move {
            let label = format!("write_status:{}", write.next.as_str());
            let result = retry_with_backoff(&policy, &label, |_| store.write_status(&write)).await;
            forward(&outbox, EngineMessage::WriteSettled { write, result, reply }).await;
        });
    }

    fn spawn_refresh(&mut self) {
        let store = Arc::clone(&self.collaborators.store);
        let scope = self.scope.clone();
        let policy = self.settings.feed_retry;
        let outbox = self.outbox.clone();
        self.jobs.spawn(async move {
            fetch_snapshot(store.as_ref(), &scope, &policy, &outbox).await;
        });
    }

    fn emit(&mut self, event: EngineEvent) {
        self.seq += 1;
        let envelope = EventEnvelope {
            event_id: Uuid::new_v4().to_string(),
            seq: self.seq,
            timestamp: Utc::now(),
            event,
        };
        // No subscribers is fine.
        let _ = self.events.send(envelope);
    }

    fn publish(&self) {
        let rows = visible(&self.mirror, self.tracker.coordinate(), &self.criteria);
        self.visible_tx.send_if_modified(|current| replace_if_changed(current, rows));
        let snapshot = self.tracker.snapshot();
        self.position_tx
            .send_if_modified(|current| replace_if_changed(current, snapshot));
        let views = self.assignments.views();
        self.assignments_tx
            .send_if_modified(|current| replace_if_changed(current, views));
        let criteria = self.criteria.clone();
        self.criteria_tx
            .send_if_modified(|current| replace_if_changed(current, criteria));
    }

    async fn teardown(&mut self, receiver: &mut mpsc::Receiver<EngineMessage>) {
        for task in self.background.drain(..) {
            task.abort();
        }
        self.jobs.abort_all();

        // Handles announced after the shutdown request still need closing.
        receiver.close();
        while let Ok(message) = receiver.try_recv() {
            match message {
                EngineMessage::WatchOpened(id) => self.collaborators.location.clear_watch(id),
                EngineMessage::FeedOpened(id) => self.collaborators.store.unsubscribe(id).await,
                EngineMessage::Shutdown(ack) => {
                    let _ = ack.send(());
                }
                _ => {}
            }
        }

        if let Some(id) = self.watch_id.take() {
            self.collaborators.location.clear_watch(id);
        }
        if let Some(id) = self.subscription_id.take() {
            self.collaborators.store.unsubscribe(id).await;
        }
        tracing::info!(collector_id = %self.collector_id, "collector engine stopped");
    }
}

fn replace_if_changed<T: PartialEq>(slot: &mut T, next: T) -> bool {
    if *slot == next {
        return false;
    }
    *slot = next;
    true
}

async fn forward(outbox: &Outbox, message: EngineMessage) -> bool {
    let Some(sender) = outbox.upgrade() else {
        return false;
    };
    sender.send(message).await.is_ok()
}

async fn track_location(service: Arc<dyn LocationService>, settings: EngineSettings, outbox: Outbox) {
    let first = match acquire_initial_fix(service.as_ref(), &settings).await {
        Ok(fix) => EngineMessage::Fix(fix),
        Err(error) => EngineMessage::LocationFailed(error),
    };
    if !forward(&outbox, first).await {
        return;
    }

    let mut watch = match service.watch_position(settings.watch_location).await {
        Ok(watch) => watch,
        Err(error) => {
            forward(&outbox, EngineMessage::LocationFailed(error)).await;
            return;
        }
    };
    if !forward(&outbox, EngineMessage::WatchOpened(watch.id)).await {
        service.clear_watch(watch.id);
        return;
    }

    while let Some(update) = watch.updates.recv().await {
        let message = match update {
            Ok(fix) => EngineMessage::Fix(fix),
            Err(error) => EngineMessage::LocationFailed(error),
        };
        if !forward(&outbox, message).await {
            return;
        }
    }
}

async fn sync_requests(
    store: Arc<dyn RequestStore>,
    collector_id: CollectorId,
    scope: VisibilityScope,
    settings: EngineSettings,
    outbox: Outbox,
) {
    if !fetch_held(store.as_ref(), &collector_id, &settings.feed_retry, &outbox).await {
        return;
    }
    if !fetch_snapshot(store.as_ref(), &scope, &settings.feed_retry, &outbox).await {
        return;
    }

    let subscribed = retry_with_backoff(&settings.feed_retry, "subscribe", |_| store.subscribe(&scope)).await;
    let message = match subscribed {
        Ok(mut feed) => {
            if !forward(&outbox, EngineMessage::FeedOpened(feed.id)).await {
                store.unsubscribe(feed.id).await;
                return;
            }
            while let Some(event) = feed.events.recv().await {
                if !forward(&outbox, EngineMessage::Feed(event)).await {
                    return;
                }
            }
            "live feed closed by the store".to_string()
        }
        Err(exhausted) => format!(
            "subscription failed after {} attempts: {}",
            exhausted.attempts, exhausted.last_error
        ),
    };
    if !forward(&outbox, EngineMessage::FeedLost { message }).await {
        return;
    }

    let interval = Duration::from_millis(settings.poll_interval_ms.max(1));
    loop {
        tokio::time::sleep(interval).await;
        if !fetch_snapshot(store.as_ref(), &scope, &settings.feed_retry, &outbox).await {
            return;
        }
    }
}

/// Work the collector accepted or completed in an earlier session.
async fn fetch_held(store: &dyn RequestStore, collector_id: &CollectorId, policy: &RetryPolicy, outbox: &Outbox) -> bool {
    let mut held = Vec::new();
    for status in [RequestStatus::Accepted, RequestStatus::Completed] {
        let scope = VisibilityScope::assigned_to(collector_id, status);
        match retry_with_backoff(policy, "query_assigned", |_| store.query_assigned(&scope)).await {
            Ok(records) => held.extend(records),
            Err(exhausted) => return forward(outbox, EngineMessage::Held(Err(exhausted))).await,
        }
    }
    forward(outbox, EngineMessage::Held(Ok(held))).await
}

async fn fetch_snapshot(
    store: &dyn RequestStore,
    scope: &VisibilityScope,
    policy: &RetryPolicy,
    outbox: &Outbox,
) -> bool {
    let requested_at = Utc::now();
    let result = retry_with_backoff(policy, "query_available", |_| store.query_available(scope)).await;
    forward(outbox, EngineMessage::Snapshot { requested_at, result }).await
}
