//! Per-zone occupancy for the current frame.
//!
//! Every `update` replaces the zone's set wholesale: there is no smoothing
//! and no memory of earlier frames. Callers that need history snapshot the
//! counts themselves.

use std::collections::{BTreeMap, HashSet};

use crate::identity::Identity;

#[derive(Clone, Debug, Default)]
pub struct OccupancyTracker {
    sets: BTreeMap<String, HashSet<Identity>>,
}

impl OccupancyTracker {
    /// Tracker with an empty set for each known zone, so unoccupied zones report 0.
    pub fn new<'a>(zone_ids: impl IntoIterator<Item = &'a str>) -> Self {
        let sets = zone_ids
            .into_iter()
            .map(|id| (id.to_string(), HashSet::new()))
            .collect();
        Self { sets }
    }

    /// Replace the zone's occupancy set and return its new size.
    pub fn update(&mut self, zone_id: &str, identities: HashSet<Identity>) -> usize {
        let count = identities.len();
        self.sets.insert(zone_id.to_string(), identities);
        count
    }

    pub fn count(&self, zone_id: &str) -> usize {
        self.sets.get(zone_id).map_or(0, HashSet::len)
    }

    pub fn members(&self, zone_id: &str) -> Option<&HashSet<Identity>> {
        self.sets.get(zone_id)
    }

    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.sets
            .iter()
            .map(|(id, set)| (id.clone(), set.len()))
            .collect()
    }
}
