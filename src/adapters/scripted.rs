use crate::adapters::{LocationService, PositionWatch, WatchId};
use crate::errors::LocationError;
use crate::models::{Coordinate, DeviceFix, PositionOptions};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Location service driven by a script: one-shot answers are queued up front,
/// watch updates are pushed by the caller.
#[derive(Default)]
pub struct ScriptedLocationService {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    one_shot: VecDeque<Result<DeviceFix, LocationError>>,
    watch_error: Option<LocationError>,
    watchers: HashMap<WatchId, mpsc::UnboundedSender<Result<DeviceFix, LocationError>>>,
    next_watch: WatchId,
    requested: Vec<PositionOptions>,
}

impl ScriptedLocationService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fix(latitude: f64, longitude: f64, accuracy_m: f64) -> DeviceFix {
        DeviceFix {
            coordinate: Coordinate::new(latitude, longitude),
            accuracy_m,
            timestamp: Utc::now(),
        }
    }

    /// Queues the answer for the next `current_position` call. With nothing
    /// queued the service reports the position as unavailable.
    pub fn push_current(&self, answer: Result<DeviceFix, LocationError>) {
        self.lock().one_shot.push_back(answer);
    }

    pub fn deny_watch(&self, error: LocationError) {
        self.lock().watch_error = Some(error);
    }

    /// Delivers a reading to every open watch.
    pub fn emit(&self, fix: DeviceFix) {
        self.lock().watchers.retain(|_, sender| sender.send(Ok(fix)).is_ok());
    }

    pub fn emit_error(&self, error: LocationError) {
        self.lock().watchers.retain(|_, sender| sender.send(Err(error)).is_ok());
    }

    pub fn active_watches(&self) -> usize {
        self.lock().watchers.len()
    }

    pub fn requested_options(&self) -> Vec<PositionOptions> {
        self.lock().requested.clone()
    }

    pub async fn wait_for_watch(&self) {
        while self.active_watches() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl LocationService for ScriptedLocationService {
    async fn current_position(&self, options: PositionOptions) -> Result<DeviceFix, LocationError> {
        let mut inner = self.lock();
        inner.requested.push(options);
        inner
            .one_shot
            .pop_front()
            .unwrap_or(Err(LocationError::PositionUnavailable))
    }

    async fn watch_position(&self, _options: PositionOptions) -> Result<PositionWatch, LocationError> {
        let mut inner = self.lock();
        if let Some(error) = inner.watch_error {
            return Err(error);
        }
        inner.next_watch += 1;
        let id = inner.next_watch;
        let (sender, updates) = mpsc::unbounded_channel();
        inner.watchers.insert(id, sender);
        Ok(PositionWatch { id, updates })
    }

    fn clear_watch(&self, id: WatchId) {
        self.lock().watchers.remove(&id);
    }
}
