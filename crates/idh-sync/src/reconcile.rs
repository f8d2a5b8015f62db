//! Merge, flatten and batch the hourly series.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use idh_core::{HarvestError, Method, MetricRow, Observation};

/// Merge two sources into one canonical series ordered by timestamp.
///
/// Overlapping hours are added field-wise and `sum` is recomputed from the combined vector.
/// A source reporting the same hour twice, or an hour with an implausible year, fails the
/// whole merge.
pub fn reconcile(
    primary: Vec<Observation>,
    secondary: Vec<Observation>,
) -> Result<Vec<Observation>, HarvestError> {
    let mut merged: BTreeMap<DateTime<Utc>, Observation> = BTreeMap::new();

    for mut observation in primary {
        observation.check_integrity()?;
        observation.derive_sum();
        match merged.entry(observation.timestamp) {
            Entry::Vacant(slot) => {
                slot.insert(observation);
            }
            Entry::Occupied(_) => return Err(duplicate_hour(&observation)),
        }
    }

    let mut seen = BTreeSet::new();
    for mut observation in secondary {
        observation.check_integrity()?;
        if !seen.insert(observation.timestamp) {
            return Err(duplicate_hour(&observation));
        }
        match merged.entry(observation.timestamp) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                existing.measurements = existing
                    .measurements
                    .checked_add(&observation.measurements)
                    .ok_or_else(|| {
                        HarvestError::integrity(
                            &observation.timestamp,
                            "merged counters overflow a 32-bit count",
                        )
                    })?;
                existing.source_org = None;
                existing.derive_sum();
            }
            Entry::Vacant(slot) => {
                observation.derive_sum();
                slot.insert(observation);
            }
        }
    }

    Ok(merged.into_values().collect())
}

/// Single-source variant used by the incremental path.
pub fn canonicalize(observations: Vec<Observation>) -> Result<Vec<Observation>, HarvestError> {
    reconcile(observations, Vec::new())
}

fn duplicate_hour(observation: &Observation) -> HarvestError {
    let org = observation
        .source_org
        .as_ref()
        .map(|o| o.as_str())
        .unwrap_or("unknown");
    HarvestError::integrity(
        &observation.timestamp,
        format!("source {org} reported the same hour more than once"),
    )
}

pub fn flatten(observation: &Observation) -> Vec<MetricRow> {
    Method::ALL
        .iter()
        .map(|method| MetricRow {
            timestamp: observation.timestamp,
            method: *method,
            count: observation.measurements.get(*method),
        })
        .collect()
}

pub fn flatten_all(observations: &[Observation]) -> Vec<MetricRow> {
    observations.iter().flat_map(flatten).collect()
}

/// Split rows into insert-sized chunks; only the last may be short.
pub fn partition<T>(rows: &[T], limit: NonZeroUsize) -> Vec<&[T]> {
    rows.chunks(limit.get()).collect()
}
