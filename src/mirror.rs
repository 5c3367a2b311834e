use crate::models::{ChangeEvent, CollectorId, Request, RequestId, RequestStatus};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    ClaimedBySelf,
    ClaimedElsewhere,
    Deleted,
}

/// What a single feed event did to the mirror.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorChange {
    Added(RequestId),
    /// Record was already present and has been replaced with newer data.
    Refreshed(RequestId),
    Removed { id: RequestId, reason: RemovalReason },
    /// Duplicate, stale or irrelevant event; nothing changed.
    Unchanged,
    Rejected { id: RequestId, reason: String },
}

impl MirrorChange {
    pub fn mutated(&self) -> bool {
        matches!(self, Self::Added(_) | Self::Refreshed(_) | Self::Removed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub added: usize,
    pub removed: usize,
    pub refreshed: usize,
    pub rejected: Vec<RequestId>,
}

impl ResyncSummary {
    pub fn mutated(&self) -> bool {
        self.added + self.removed + self.refreshed > 0
    }
}

/// Local copy of the remote pool of available requests, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct RequestMirror {
    entries: HashMap<RequestId, Request>,
}

impl RequestMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &RequestId) -> Option<&Request> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.entries.values()
    }

    /// Used by the lifecycle controller when this worker claims an item.
    pub(crate) fn take(&mut self, id: &RequestId) -> Option<Request> {
        self.entries.remove(id)
    }

    pub fn apply(&mut self, event: ChangeEvent, self_id: &CollectorId) -> MirrorChange {
        match event {
            ChangeEvent::Insert { record } => {
                if record.status != RequestStatus::Available {
                    return MirrorChange::Unchanged;
                }
                if let Some(reason) = malformed(&record) {
                    return MirrorChange::Rejected { id: record.id, reason };
                }
                if self.entries.contains_key(&record.id) {
                    tracing::debug!(request_id = %record.id, "duplicate insert ignored");
                    return MirrorChange::Unchanged;
                }
                let id = record.id.clone();
                self.entries.insert(id.clone(), record);
                MirrorChange::Added(id)
            }
            ChangeEvent::Update { record } => {
                if record.status == RequestStatus::Available {
                    if let Some(reason) = malformed(&record) {
                        // A record we can no longer place must not linger.
                        self.entries.remove(&record.id);
                        return MirrorChange::Rejected { id: record.id, reason };
                    }
                    let id = record.id.clone();
                    return match self.entries.insert(id.clone(), record) {
                        Some(previous) if previous == self.entries[&id] => MirrorChange::Unchanged,
                        Some(_) => MirrorChange::Refreshed(id),
                        None => MirrorChange::Added(id),
                    };
                }

                if self.entries.remove(&record.id).is_none() {
                    return MirrorChange::Unchanged;
                }
                let reason = if record.assigned_collector.as_ref() == Some(self_id) {
                    RemovalReason::ClaimedBySelf
                } else {
                    RemovalReason::ClaimedElsewhere
                };
                MirrorChange::Removed { id: record.id, reason }
            }
            ChangeEvent::Delete { id } => {
                if self.entries.remove(&id).is_none() {
                    return MirrorChange::Unchanged;
                }
                MirrorChange::Removed {
                    id,
                    reason: RemovalReason::Deleted,
                }
            }
        }
    }

    /// Replaces the mirror with a full snapshot from the store, keeping only
    /// well-formed available records.
    pub fn resync(&mut self, records: Vec<Request>) -> ResyncSummary {
        let mut summary = ResyncSummary::default();
        let mut seen = HashSet::with_capacity(records.len());

        for record in records {
            if record.status != RequestStatus::Available {
                continue;
            }
            if let Some(reason) = malformed(&record) {
                tracing::warn!(request_id = %record.id, reason = %reason, "snapshot record discarded");
                summary.rejected.push(record.id);
                continue;
            }
            if !seen.insert(record.id.clone()) {
                tracing::warn!(request_id = %record.id, "snapshot contained duplicate id");
                continue;
            }
            match self.entries.get(&record.id) {
                Some(existing) if *existing == record => {}
                Some(_) => {
                    summary.refreshed += 1;
                    self.entries.insert(record.id.clone(), record);
                }
                None => {
                    summary.added += 1;
                    self.entries.insert(record.id.clone(), record);
                }
            }
        }

        let before = self.entries.len();
        self.entries.retain(|id, _| seen.contains(id));
        summary.removed = before - self.entries.len();
        summary
    }
}

fn malformed(record: &Request) -> Option<String> {
    if record.valid_coordinate().is_none() {
        return Some("missing or out-of-range coordinate".to_string());
    }
    if !record.fee_amount.is_finite() || record.fee_amount < 0.0 {
        return Some(format!("invalid fee amount {}", record.fee_amount));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{MirrorChange, RemovalReason, RequestMirror};
    use crate::models::{
        ChangeEvent, CollectorId, Coordinate, Priority, Request, RequestId, RequestStatus, WasteCategory,
    };
    use chrono::Utc;

    fn me() -> CollectorId {
        CollectorId::new("collector-1")
    }

    fn available(id: &str) -> Request {
        Request {
            id: RequestId::new(id),
            waste_category: WasteCategory::Paper,
            coordinate: Some(Coordinate::new(6.5, 3.4)),
            human_location: "Surulere".to_string(),
            fee_amount: 800.0,
            priority: Priority::Low,
            status: RequestStatus::Available,
            created_at: Utc::now(),
            assigned_collector: None,
            accepted_at: None,
            completed_at: None,
            disposed_at: None,
            disposal_site: None,
        }
    }

    fn accepted_by(id: &str, collector: &str) -> Request {
        let mut record = available(id);
        record.status = RequestStatus::Accepted;
        record.assigned_collector = Some(CollectorId::new(collector));
        record.accepted_at = Some(Utc::now());
        record
    }

    #[test]
    fn duplicate_insert_yields_one_entry() {
        let mut mirror = RequestMirror::new();
        let first = mirror.apply(ChangeEvent::Insert { record: available("r1") }, &me());
        let second = mirror.apply(ChangeEvent::Insert { record: available("r1") }, &me());
        assert_eq!(first, MirrorChange::Added(RequestId::new("r1")));
        assert_eq!(second, MirrorChange::Unchanged);
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn insert_of_non_available_record_is_ignored() {
        let mut mirror = RequestMirror::new();
        let change = mirror.apply(ChangeEvent::Insert { record: accepted_by("r1", "other") }, &me());
        assert_eq!(change, MirrorChange::Unchanged);
        assert!(mirror.is_empty());
    }

    #[test]
    fn insert_without_coordinate_is_rejected() {
        let mut mirror = RequestMirror::new();
        let mut record = available("r1");
        record.coordinate = None;
        let change = mirror.apply(ChangeEvent::Insert { record }, &me());
        assert!(matches!(change, MirrorChange::Rejected { .. }));
        assert!(mirror.is_empty());
    }

    #[test]
    fn claim_by_other_collector_removes_entry() {
        let mut mirror = RequestMirror::new();
        mirror.apply(ChangeEvent::Insert { record: available("r1") }, &me());
        let change = mirror.apply(ChangeEvent::Update { record: accepted_by("r1", "other") }, &me());
        assert_eq!(
            change,
            MirrorChange::Removed {
                id: RequestId::new("r1"),
                reason: RemovalReason::ClaimedElsewhere
            }
        );
        assert!(mirror.is_empty());
    }

    #[test]
    fn own_claim_is_tagged_so_no_notification_is_raised() {
        let mut mirror = RequestMirror::new();
        mirror.apply(ChangeEvent::Insert { record: available("r1") }, &me());
        let change = mirror.apply(ChangeEvent::Update { record: accepted_by("r1", "collector-1") }, &me());
        assert_eq!(
            change,
            MirrorChange::Removed {
                id: RequestId::new("r1"),
                reason: RemovalReason::ClaimedBySelf
            }
        );
    }

    #[test]
    fn release_back_to_available_adds_if_absent() {
        let mut mirror = RequestMirror::new();
        let change = mirror.apply(ChangeEvent::Update { record: available("r1") }, &me());
        assert_eq!(change, MirrorChange::Added(RequestId::new("r1")));

        let same = mirror.get(&RequestId::new("r1")).cloned().expect("entry");
        let again = mirror.apply(ChangeEvent::Update { record: same }, &me());
        assert_eq!(again, MirrorChange::Unchanged);
        assert_eq!(mirror.len(), 1);
    }

    #[test]
    fn update_of_available_record_refreshes_fields() {
        let mut mirror = RequestMirror::new();
        mirror.apply(ChangeEvent::Insert { record: available("r1") }, &me());
        let mut changed = mirror.get(&RequestId::new("r1")).cloned().expect("entry");
        changed.fee_amount = 1_200.0;
        let change = mirror.apply(ChangeEvent::Update { record: changed }, &me());
        assert_eq!(change, MirrorChange::Refreshed(RequestId::new("r1")));
        assert_eq!(mirror.get(&RequestId::new("r1")).map(|r| r.fee_amount), Some(1_200.0));
    }

    #[test]
    fn delete_is_unconditional_and_idempotent() {
        let mut mirror = RequestMirror::new();
        mirror.apply(ChangeEvent::Insert { record: available("r1") }, &me());
        let removed = mirror.apply(ChangeEvent::Delete { id: RequestId::new("r1") }, &me());
        assert!(removed.mutated());
        let again = mirror.apply(ChangeEvent::Delete { id: RequestId::new("r1") }, &me());
        assert_eq!(again, MirrorChange::Unchanged);
    }

    #[test]
    fn only_available_records_survive_any_event_sequence() {
        let mut mirror = RequestMirror::new();
        let events = vec![
            ChangeEvent::Insert { record: available("a") },
            ChangeEvent::Insert { record: available("b") },
            ChangeEvent::Update { record: accepted_by("a", "other") },
            ChangeEvent::Insert { record: accepted_by("c", "other") },
            ChangeEvent::Update { record: available("c") },
            ChangeEvent::Delete { id: RequestId::new("b") },
            ChangeEvent::Insert { record: available("c") },
        ];
        for event in events {
            mirror.apply(event, &me());
        }
        let ids = mirror.iter().map(|r| r.id.as_str().to_string()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["c".to_string()]);
        assert!(mirror.iter().all(|r| r.status == RequestStatus::Available));
    }

    #[test]
    fn resync_reconciles_adds_removes_and_refreshes() {
        let mut mirror = RequestMirror::new();
        mirror.apply(ChangeEvent::Insert { record: available("keep") }, &me());
        mirror.apply(ChangeEvent::Insert { record: available("gone") }, &me());

        let mut kept = mirror.get(&RequestId::new("keep")).cloned().expect("entry");
        kept.priority = Priority::High;
        let mut broken = available("broken");
        broken.coordinate = Some(Coordinate::new(95.0, 0.0));

        let summary = mirror.resync(vec![kept, available("new"), available("new"), broken, accepted_by("taken", "x")]);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.rejected, vec![RequestId::new("broken")]);
        assert_eq!(mirror.len(), 2);
        assert!(mirror.contains(&RequestId::new("new")));
        assert!(!mirror.contains(&RequestId::new("gone")));
    }
}
