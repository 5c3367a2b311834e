use crate::distance::distance_m;
use crate::mirror::RequestMirror;
use crate::models::{
    CollectorId, Coordinate, FailureReason, LifecycleOutcome, RefusalReason, Request, RequestId, RequestStatus, StatusStamp,
    StatusWrite, WriteOutcome,
};
use crate::position::PositionTracker;
use crate::retry::RetryExhausted;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// The worker's own requests, split by how far along they are.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentViews {
    pub accepted: Vec<Request>,
    pub completed: Vec<Request>,
    pub disposed: Vec<Request>,
}

#[derive(Debug, Default)]
pub struct Assignments {
    accepted: HashMap<RequestId, Request>,
    completed: HashMap<RequestId, Request>,
    disposed: HashMap<RequestId, Request>,
    /// Local time each accepted write settled, to tell stale snapshots apart.
    held_since: HashMap<RequestId, DateTime<Utc>>,
    in_flight: HashSet<RequestId>,
}

impl Assignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status of a request this worker holds, if any.
    pub fn status_of(&self, id: &RequestId) -> Option<RequestStatus> {
        if self.accepted.contains_key(id) {
            Some(RequestStatus::Accepted)
        } else if self.completed.contains_key(id) {
            Some(RequestStatus::Completed)
        } else if self.disposed.contains_key(id) {
            Some(RequestStatus::Disposed)
        } else {
            None
        }
    }

    pub fn held_since(&self, id: &RequestId) -> Option<DateTime<Utc>> {
        self.held_since.get(id).copied()
    }

    pub fn is_in_flight(&self, id: &RequestId) -> bool {
        self.in_flight.contains(id)
    }

    pub fn views(&self) -> AssignmentViews {
        AssignmentViews {
            accepted: sorted(&self.accepted, |request| request.accepted_at),
            completed: sorted(&self.completed, |request| request.completed_at),
            disposed: sorted(&self.disposed, |request| request.disposed_at),
        }
    }

    pub fn plan_accept(
        &mut self,
        mirror: &RequestMirror,
        id: &RequestId,
        collector_id: &CollectorId,
        collector_online: bool,
    ) -> Result<StatusWrite, RefusalReason> {
        if !collector_online {
            return Err(RefusalReason::CollectorOffline);
        }
        self.ensure_idle(id)?;
        if !mirror.contains(id) {
            return Err(match self.status_of(id) {
                Some(current) => RefusalReason::InvalidStatus {
                    current,
                    required: RequestStatus::Available,
                },
                None => RefusalReason::NotFound,
            });
        }
        Ok(self.begin(id, collector_id, RequestStatus::Available, None, None))
    }

    /// Completion is gated on a trustworthy live fix inside the geofence.
    pub fn plan_complete(
        &mut self,
        mirror: &RequestMirror,
        id: &RequestId,
        collector_id: &CollectorId,
        tracker: &PositionTracker,
        geofence_radius_m: f64,
    ) -> Result<StatusWrite, RefusalReason> {
        self.ensure_idle(id)?;
        let request = self.require(mirror, id, RequestStatus::Accepted)?;
        let Some(target) = request.valid_coordinate() else {
            return Err(RefusalReason::RequestLocationUnknown);
        };
        if !tracker.is_trustworthy() {
            let reading = tracker.reading();
            return Err(RefusalReason::PositionNotTrusted {
                source: reading.source,
                accuracy_m: reading.accuracy_m,
            });
        }
        let here = tracker.coordinate();
        let distance = distance_m(here, target);
        if distance > geofence_radius_m {
            return Err(RefusalReason::TooFar {
                distance_m: distance,
                limit_m: geofence_radius_m,
            });
        }
        Ok(self.begin(id, collector_id, RequestStatus::Accepted, None, Some(here)))
    }

    pub fn plan_dispose(
        &mut self,
        mirror: &RequestMirror,
        id: &RequestId,
        collector_id: &CollectorId,
        site: &str,
        allowed_sites: &[String],
    ) -> Result<StatusWrite, RefusalReason> {
        self.ensure_idle(id)?;
        self.require(mirror, id, RequestStatus::Completed)?;
        let site = site.trim();
        if site.is_empty() {
            return Err(RefusalReason::MissingDisposalSite);
        }
        let site = if allowed_sites.is_empty() {
            site.to_string()
        } else {
            allowed_sites
                .iter()
                .find(|allowed| allowed.trim().eq_ignore_ascii_case(site))
                .map(|allowed| allowed.trim().to_string())
                .ok_or_else(|| RefusalReason::UnknownDisposalSite { site: site.to_string() })?
        };
        Ok(self.begin(id, collector_id, RequestStatus::Completed, Some(site), None))
    }

    /// Folds the result of a remote write back into the partitions.
    pub fn settle(
        &mut self,
        mirror: &mut RequestMirror,
        write: &StatusWrite,
        result: Result<WriteOutcome, RetryExhausted>,
    ) -> LifecycleOutcome {
        self.in_flight.remove(&write.request_id);
        let result = result.map(|outcome| match outcome {
            // An earlier attempt committed but its reply never arrived.
            WriteOutcome::Conflict { current: Some(record) } if already_applied(write, &record) => {
                tracing::info!(
                    request_id = %write.request_id,
                    status = record.status.as_str(),
                    "status write already applied by an earlier attempt"
                );
                WriteOutcome::Applied { record }
            }
            other => other,
        });
        match result {
            Ok(WriteOutcome::Applied { record }) => {
                let id = record.id.clone();
                match record.status {
                    RequestStatus::Accepted => {
                        mirror.take(&id);
                        self.held_since.insert(id.clone(), Utc::now());
                        self.accepted.insert(id, record.clone());
                    }
                    RequestStatus::Completed => {
                        self.accepted.remove(&id);
                        self.completed.insert(id, record.clone());
                    }
                    RequestStatus::Disposed => {
                        self.completed.remove(&id);
                        self.disposed.insert(id, record.clone());
                    }
                    RequestStatus::Available => {
                        tracing::warn!(request_id = %id, "store applied a write that left the request available");
                    }
                }
                tracing::info!(request_id = %record.id, status = record.status.as_str(), "status write applied");
                LifecycleOutcome::Success { request: record }
            }
            Ok(WriteOutcome::Conflict { current }) => {
                tracing::info!(
                    request_id = %write.request_id,
                    expected = write.expected.as_str(),
                    current = current.as_ref().map(|record| record.status.as_str()).unwrap_or("missing"),
                    "status write lost a race"
                );
                LifecycleOutcome::Conflict {
                    request_id: write.request_id.clone(),
                    current: current.map(|record| record.status),
                }
            }
            Err(exhausted) => {
                let code = if exhausted.last_error.is_transient() {
                    "WRITE_FAILED"
                } else {
                    "WRITE_REJECTED"
                };
                LifecycleOutcome::Failed {
                    reason: FailureReason {
                        code: code.to_string(),
                        attempts: exhausted.attempts,
                        message: exhausted.last_error.to_string(),
                    },
                }
            }
        }
    }

    /// Takes over a record the store shows as held by this collector, e.g.
    /// after a restart or when the feed reports our claim first. Returns
    /// true when the request was not tracked yet.
    pub fn adopt(&mut self, mirror: &mut RequestMirror, record: Request, collector_id: &CollectorId) -> bool {
        if record.assigned_collector.as_ref() != Some(collector_id) || self.status_of(&record.id).is_some() {
            return false;
        }
        let id = record.id.clone();
        match record.status {
            RequestStatus::Accepted => {
                self.held_since.insert(id.clone(), Utc::now());
                self.accepted.insert(id.clone(), record);
            }
            RequestStatus::Completed => {
                self.completed.insert(id.clone(), record);
            }
            RequestStatus::Disposed => {
                self.disposed.insert(id.clone(), record);
            }
            RequestStatus::Available => return false,
        }
        mirror.take(&id);
        true
    }

    /// Screens a snapshot of the available pool against our own claims.
    /// Records fetched before one of our accepts settled are dropped. Records
    /// fetched afterwards that still show as available mean the store
    /// released the assignment. Returns the records to resync with and the
    /// ids released.
    pub fn screen_snapshot(
        &mut self,
        records: Vec<Request>,
        requested_at: DateTime<Utc>,
    ) -> (Vec<Request>, Vec<RequestId>) {
        let mut kept = Vec::with_capacity(records.len());
        let mut released = Vec::new();
        for record in records {
            if record.status == RequestStatus::Available {
                if let Some(since) = self.held_since(&record.id) {
                    if since >= requested_at {
                        continue;
                    }
                    if self.release(&record.id) {
                        released.push(record.id.clone());
                    }
                }
            }
            kept.push(record);
        }
        (kept, released)
    }

    /// Drops an accepted request that the store handed back to the pool.
    /// Returns true when the request was one of ours.
    pub fn release(&mut self, id: &RequestId) -> bool {
        if self.accepted.remove(id).is_none() {
            return false;
        }
        self.held_since.remove(id);
        true
    }

    fn ensure_idle(&self, id: &RequestId) -> Result<(), RefusalReason> {
        if self.in_flight.contains(id) {
            return Err(RefusalReason::WriteInFlight);
        }
        Ok(())
    }

    fn require(&self, mirror: &RequestMirror, id: &RequestId, required: RequestStatus) -> Result<&Request, RefusalReason> {
        let partition = match required {
            RequestStatus::Accepted => &self.accepted,
            RequestStatus::Completed => &self.completed,
            RequestStatus::Disposed => &self.disposed,
            RequestStatus::Available => return Err(RefusalReason::NotFound),
        };
        if let Some(request) = partition.get(id) {
            return Ok(request);
        }
        let current = if mirror.contains(id) {
            Some(RequestStatus::Available)
        } else {
            self.status_of(id)
        };
        Err(match current {
            Some(current) => RefusalReason::InvalidStatus { current, required },
            None => RefusalReason::NotFound,
        })
    }

    fn begin(
        &mut self,
        id: &RequestId,
        collector_id: &CollectorId,
        expected: RequestStatus,
        disposal_site: Option<String>,
        position: Option<Coordinate>,
    ) -> StatusWrite {
        self.in_flight.insert(id.clone());
        StatusWrite {
            request_id: id.clone(),
            collector_id: collector_id.clone(),
            expected,
            // Only called with a status that has a successor.
            next: expected.next().unwrap_or(expected),
            stamp: StatusStamp {
                at: Utc::now(),
                disposal_site,
                position,
            },
        }
    }
}

fn already_applied(write: &StatusWrite, record: &Request) -> bool {
    record.status == write.next && record.assigned_collector.as_ref() == Some(&write.collector_id)
}

fn sorted<K: Ord>(partition: &HashMap<RequestId, Request>, key: impl Fn(&Request) -> K) -> Vec<Request> {
    let mut requests = partition.values().cloned().collect::<Vec<_>>();
    requests.sort_by(|a, b| key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id)));
    requests
}

#[cfg(test)]
mod tests {
    use super::Assignments;
    use crate::config::EngineSettings;
    use crate::errors::StoreError;
    use crate::mirror::RequestMirror;
    use crate::models::{
        ChangeEvent, CollectorId, Coordinate, DeviceFix, LifecycleOutcome, Priority, PositionSource, RefusalReason,
        Request, RequestId, RequestStatus, StatusWrite, WasteCategory, WriteOutcome,
    };
    use crate::position::PositionTracker;
    use crate::retry::RetryExhausted;
    use chrono::{Duration, Utc};

    const SITE: Coordinate = Coordinate::new(6.5, 3.4);
    const METERS_PER_DEGREE: f64 = 6_371_000.0 * std::f64::consts::PI / 180.0;

    fn me() -> CollectorId {
        CollectorId::new("me")
    }

    fn id() -> RequestId {
        RequestId::new("r1")
    }

    fn request() -> Request {
        Request {
            id: id(),
            waste_category: WasteCategory::Metal,
            coordinate: Some(SITE),
            human_location: "Ikeja".to_string(),
            fee_amount: 2_000.0,
            priority: Priority::High,
            status: RequestStatus::Available,
            created_at: Utc::now(),
            assigned_collector: None,
            accepted_at: None,
            completed_at: None,
            disposed_at: None,
            disposal_site: None,
        }
    }

    fn mirror() -> RequestMirror {
        let mut mirror = RequestMirror::new();
        mirror.apply(ChangeEvent::Insert { record: request() }, &me());
        mirror
    }

    fn live_tracker_at(meters_north: f64, accuracy_m: f64) -> PositionTracker {
        let mut tracker = PositionTracker::bootstrap(&EngineSettings::default(), None);
        tracker.observe(DeviceFix {
            coordinate: Coordinate::new(SITE.latitude + meters_north / METERS_PER_DEGREE, SITE.longitude),
            accuracy_m,
            timestamp: Utc::now(),
        });
        tracker
    }

    fn applied(write: &StatusWrite) -> Result<WriteOutcome, RetryExhausted> {
        let mut record = request();
        record.status = write.next;
        record.assigned_collector = Some(write.collector_id.clone());
        match write.next {
            RequestStatus::Accepted => record.accepted_at = Some(write.stamp.at),
            RequestStatus::Completed => record.completed_at = Some(write.stamp.at),
            RequestStatus::Disposed => {
                record.disposed_at = Some(write.stamp.at);
                record.disposal_site = write.stamp.disposal_site.clone();
            }
            RequestStatus::Available => {}
        }
        Ok(WriteOutcome::Applied { record })
    }

    fn accepted_book(mirror: &mut RequestMirror) -> Assignments {
        let mut book = Assignments::new();
        let write = book.plan_accept(mirror, &id(), &me(), true).expect("accept planned");
        let outcome = book.settle(mirror, &write, applied(&write));
        assert!(outcome.is_success());
        book
    }

    #[test]
    fn accept_moves_request_out_of_available_view() {
        let mut mirror = mirror();
        let book = accepted_book(&mut mirror);
        assert!(mirror.is_empty());
        assert_eq!(book.status_of(&id()), Some(RequestStatus::Accepted));
        assert_eq!(book.views().accepted.len(), 1);
    }

    #[test]
    fn accept_refused_when_offline_or_unknown() {
        let mirror = mirror();
        let mut book = Assignments::new();
        assert_eq!(
            book.plan_accept(&mirror, &id(), &me(), false),
            Err(RefusalReason::CollectorOffline)
        );
        assert_eq!(
            book.plan_accept(&mirror, &RequestId::new("ghost"), &me(), true),
            Err(RefusalReason::NotFound)
        );
    }

    #[test]
    fn second_command_waits_for_first_write() {
        let mirror = mirror();
        let mut book = Assignments::new();
        book.plan_accept(&mirror, &id(), &me(), true).expect("first");
        assert_eq!(
            book.plan_accept(&mirror, &id(), &me(), true),
            Err(RefusalReason::WriteInFlight)
        );
    }

    #[test]
    fn conflict_leaves_mirror_to_reconciler() {
        let mut mirror = mirror();
        let mut book = Assignments::new();
        let write = book.plan_accept(&mirror, &id(), &me(), true).expect("planned");
        let mut rival = request();
        rival.status = RequestStatus::Accepted;
        rival.assigned_collector = Some(CollectorId::new("rival"));
        let outcome = book.settle(&mut mirror, &write, Ok(WriteOutcome::Conflict { current: Some(rival) }));
        assert_eq!(
            outcome,
            LifecycleOutcome::Conflict {
                request_id: id(),
                current: Some(RequestStatus::Accepted)
            }
        );
        assert!(mirror.contains(&id()));
        assert!(!book.is_in_flight(&id()));
        assert_eq!(book.status_of(&id()), None);
    }

    #[test]
    fn conflict_showing_our_own_write_counts_as_success() {
        let mut mirror = mirror();
        let mut book = Assignments::new();
        let write = book.plan_accept(&mirror, &id(), &me(), true).expect("planned");
        let Ok(WriteOutcome::Applied { record: committed }) = applied(&write) else {
            panic!("expected applied record");
        };

        let outcome = book.settle(
            &mut mirror,
            &write,
            Ok(WriteOutcome::Conflict {
                current: Some(committed.clone()),
            }),
        );
        assert_eq!(outcome, LifecycleOutcome::Success { request: committed });
        assert!(!mirror.contains(&id()));
        assert_eq!(book.status_of(&id()), Some(RequestStatus::Accepted));
        assert!(book.held_since(&id()).is_some());
    }

    #[test]
    fn adopt_takes_over_own_claims_only() {
        let mut mirror = mirror();
        let mut book = Assignments::new();

        let mut theirs = request();
        theirs.status = RequestStatus::Accepted;
        theirs.assigned_collector = Some(CollectorId::new("rival"));
        assert!(!book.adopt(&mut mirror, theirs, &me()));
        assert!(mirror.contains(&id()));

        let mut ours = request();
        ours.status = RequestStatus::Accepted;
        ours.assigned_collector = Some(me());
        assert!(book.adopt(&mut mirror, ours.clone(), &me()));
        assert!(!mirror.contains(&id()));
        assert_eq!(book.status_of(&id()), Some(RequestStatus::Accepted));
        assert!(!book.adopt(&mut mirror, ours, &me()));

        let mut finished = request();
        finished.id = RequestId::new("r2");
        finished.status = RequestStatus::Completed;
        finished.assigned_collector = Some(me());
        assert!(book.adopt(&mut mirror, finished, &me()));
        assert_eq!(book.views().completed.len(), 1);
    }

    #[test]
    fn snapshot_fetched_before_our_claim_settled_is_ignored() {
        let mut mirror = mirror();
        let requested_at = Utc::now() - Duration::seconds(5);
        let mut book = accepted_book(&mut mirror);

        let (kept, released) = book.screen_snapshot(vec![request()], requested_at);
        assert!(kept.is_empty());
        assert!(released.is_empty());
        mirror.resync(kept);
        assert!(!mirror.contains(&id()));
        assert_eq!(book.status_of(&id()), Some(RequestStatus::Accepted));
    }

    #[test]
    fn snapshot_fetched_after_our_claim_releases_it() {
        let mut mirror = mirror();
        let mut book = accepted_book(&mut mirror);
        let requested_at = Utc::now() + Duration::seconds(5);

        let (kept, released) = book.screen_snapshot(vec![request()], requested_at);
        assert_eq!(released, vec![id()]);
        mirror.resync(kept);
        assert!(mirror.contains(&id()));
        assert_eq!(book.status_of(&id()), None);
        assert!(book.held_since(&id()).is_none());
    }

    #[test]
    fn exhausted_retries_surface_as_failure() {
        let mut mirror = mirror();
        let mut book = Assignments::new();
        let write = book.plan_accept(&mirror, &id(), &me(), true).expect("planned");
        let outcome = book.settle(
            &mut mirror,
            &write,
            Err(RetryExhausted {
                attempts: 4,
                last_error: StoreError::Transient("timeout".to_string()),
            }),
        );
        let LifecycleOutcome::Failed { reason } = outcome else {
            panic!("expected failure");
        };
        assert_eq!(reason.code, "WRITE_FAILED");
        assert_eq!(reason.attempts, 4);
        assert!(mirror.contains(&id()));
    }

    #[test]
    fn complete_refused_when_eighty_meters_away() {
        let mut mirror = mirror();
        let mut book = accepted_book(&mut mirror);
        let tracker = live_tracker_at(80.0, 10.0);

        let refusal = book
            .plan_complete(&mirror, &id(), &me(), &tracker, 50.0)
            .expect_err("outside geofence");
        let RefusalReason::TooFar { distance_m, limit_m } = refusal else {
            panic!("expected too far, got {refusal:?}");
        };
        assert!((distance_m - 80.0).abs() < 0.5);
        assert_eq!(limit_m, 50.0);
        assert_eq!(book.status_of(&id()), Some(RequestStatus::Accepted));
        assert!(!book.is_in_flight(&id()));
    }

    #[test]
    fn complete_within_geofence_stamps_position() {
        let mut mirror = mirror();
        let mut book = accepted_book(&mut mirror);
        let tracker = live_tracker_at(20.0, 10.0);

        let write = book
            .plan_complete(&mirror, &id(), &me(), &tracker, 50.0)
            .expect("inside geofence");
        assert_eq!(write.next, RequestStatus::Completed);
        assert_eq!(write.stamp.position, Some(tracker.coordinate()));

        let outcome = book.settle(&mut mirror, &write, applied(&write));
        assert!(outcome.is_success());
        assert_eq!(book.status_of(&id()), Some(RequestStatus::Completed));
        assert!(book.views().accepted.is_empty());
    }

    #[test]
    fn complete_requires_live_fix() {
        let mut mirror = mirror();
        let mut book = accepted_book(&mut mirror);
        let tracker = PositionTracker::bootstrap(&EngineSettings::default(), None);

        let refusal = book
            .plan_complete(&mirror, &id(), &me(), &tracker, 50.0)
            .expect_err("fallback is not trusted");
        assert_eq!(
            refusal,
            RefusalReason::PositionNotTrusted {
                source: PositionSource::Fallback,
                accuracy_m: None
            }
        );

        let mut noisy = live_tracker_at(5.0, 10.0);
        noisy.observe(DeviceFix {
            coordinate: SITE,
            accuracy_m: 90.0,
            timestamp: Utc::now(),
        });
        assert!(matches!(
            book.plan_complete(&mirror, &id(), &me(), &noisy, 50.0),
            Err(RefusalReason::PositionNotTrusted { .. })
        ));
    }

    #[test]
    fn complete_refused_unless_accepted() {
        let mirror = mirror();
        let mut book = Assignments::new();
        let tracker = live_tracker_at(0.0, 5.0);
        assert_eq!(
            book.plan_complete(&mirror, &id(), &me(), &tracker, 50.0),
            Err(RefusalReason::InvalidStatus {
                current: RequestStatus::Available,
                required: RequestStatus::Accepted
            })
        );
    }

    #[test]
    fn dispose_refused_unless_completed() {
        let mut mirror = mirror();
        let mut book = accepted_book(&mut mirror);
        assert_eq!(
            book.plan_dispose(&mirror, &id(), &me(), "Olusosun", &[]),
            Err(RefusalReason::InvalidStatus {
                current: RequestStatus::Accepted,
                required: RequestStatus::Completed
            })
        );
    }

    #[test]
    fn dispose_validates_site_and_finishes_lifecycle() {
        let mut mirror = mirror();
        let mut book = accepted_book(&mut mirror);
        let tracker = live_tracker_at(0.0, 5.0);
        let write = book.plan_complete(&mirror, &id(), &me(), &tracker, 50.0).expect("complete");
        book.settle(&mut mirror, &write, applied(&write));

        let allowed = vec!["Olusosun".to_string(), "Solous II".to_string()];
        assert_eq!(
            book.plan_dispose(&mirror, &id(), &me(), "   ", &allowed),
            Err(RefusalReason::MissingDisposalSite)
        );
        assert_eq!(
            book.plan_dispose(&mirror, &id(), &me(), "Epe", &allowed),
            Err(RefusalReason::UnknownDisposalSite {
                site: "Epe".to_string()
            })
        );

        let write = book
            .plan_dispose(&mirror, &id(), &me(), "olusosun", &allowed)
            .expect("dispose planned");
        assert_eq!(write.stamp.disposal_site.as_deref(), Some("Olusosun"));
        let LifecycleOutcome::Success { request } = book.settle(&mut mirror, &write, applied(&write)) else {
            panic!("expected success");
        };
        assert_eq!(request.status, RequestStatus::Disposed);
        assert!(request.disposed_at.is_some());
        assert_eq!(book.views().disposed.len(), 1);
        assert!(book.views().completed.is_empty());
    }

    #[test]
    fn release_only_touches_own_accepted() {
        let mut mirror = mirror();
        let mut book = accepted_book(&mut mirror);
        assert!(!book.release(&RequestId::new("other")));
        assert!(book.release(&id()));
        assert_eq!(book.status_of(&id()), None);
    }
}
