use crate::config::EngineSettings;
use crate::distance::distance_km;
use crate::mirror::RequestMirror;
use crate::models::{Coordinate, FilterCriteria, FilterCriteriaInput, PriorityFilter, VisibleRequest, WasteCategory};
use std::cmp::Ordering;
use std::collections::BTreeSet;

impl FilterCriteria {
    /// Criteria a freshly started session uses.
    pub fn defaults(settings: &EngineSettings) -> Self {
        Self {
            radius_km: settings.default_radius_km,
            waste_categories: BTreeSet::new(),
            min_fee: 0.0,
            priority: PriorityFilter::All,
            collector_online: true,
        }
    }

    /// Applies defaults and the radius floor to UI-supplied criteria.
    pub fn from_input(input: &FilterCriteriaInput, settings: &EngineSettings) -> Self {
        let defaults = Self::defaults(settings);

        let radius_km = input
            .radius_km
            .filter(|radius| radius.is_finite() && *radius > 0.0)
            .unwrap_or(defaults.radius_km)
            .max(settings.min_radius_km);

        let waste_categories = match &input.waste_categories {
            None => BTreeSet::new(),
            Some(names) if names.iter().any(|name| name.trim().eq_ignore_ascii_case("all")) => BTreeSet::new(),
            // Unknown names fold into `Other`, the same bucket unknown record
            // categories land in, so the filter never widens.
            Some(names) => names
                .iter()
                .map(|name| {
                    name.parse::<WasteCategory>().unwrap_or_else(|error| {
                        tracing::warn!(error = %error, "unknown category in filter, matching as other");
                        WasteCategory::Other
                    })
                })
                .collect(),
        };

        let min_fee = input
            .min_fee
            .filter(|fee| fee.is_finite() && *fee >= 0.0)
            .unwrap_or(defaults.min_fee);

        Self {
            radius_km,
            waste_categories,
            min_fee,
            priority: input.priority.unwrap_or(defaults.priority),
            collector_online: input.collector_online.unwrap_or(defaults.collector_online),
        }
    }
}

/// Derives the ordered list a collector sees. Pure: same inputs, same output.
pub fn visible(mirror: &RequestMirror, position: Coordinate, criteria: &FilterCriteria) -> Vec<VisibleRequest> {
    if !criteria.collector_online {
        return Vec::new();
    }

    let mut rows = mirror
        .iter()
        .filter_map(|request| {
            let coordinate = request.valid_coordinate()?;
            let distance = distance_km(position, coordinate);
            (distance <= criteria.radius_km).then_some((request, distance))
        })
        .filter(|(request, _)| {
            criteria.waste_categories.is_empty() || criteria.waste_categories.contains(&request.waste_category)
        })
        .filter(|(request, _)| request.fee_amount >= criteria.min_fee)
        .filter(|(request, _)| criteria.priority.admits(request.priority))
        .map(|(request, distance_km)| VisibleRequest {
            request: request.clone(),
            distance_km,
        })
        .collect::<Vec<_>>();

    rows.sort_by(|a, b| {
        a.distance_km
            .partial_cmp(&b.distance_km)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.request.created_at.cmp(&b.request.created_at))
            .then_with(|| a.request.id.cmp(&b.request.id))
    });
    rows
}
