use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::debug;

use crate::db::AnalyticsStore;
use crate::types::{is_none_sentinel, AnalyticsSummary, Observation};

/// First summary row for a camera, seeded from its first observation.
pub fn seed(camera_id: i64, obs: &Observation) -> AnalyticsSummary {
    AnalyticsSummary {
        camera_id,
        total_footage_analyzed: 1,
        total_individuals_detected: obs.individual_count as u64,
        average_individuals_per_footage: obs.individual_count as f64,
        total_unusual_incidents: incident(&obs.unusual_activity),
        total_animal_incidents: incident(&obs.animal_activity),
        total_unusual_crowd_incidents: obs.has_unusual_crowd() as u64,
        total_vehicles_detected: obs.vehicle_count() as u64,
        created_at: Utc::now(),
    }
}

/// Fold one more observation into an existing summary.
///
/// The average follows `(old_average + count) / new_footage_count`, which
/// is not the cumulative mean. Stored history depends on this recurrence.
pub fn fold(prev: AnalyticsSummary, obs: &Observation) -> AnalyticsSummary {
    let footage = prev.total_footage_analyzed + 1;
    AnalyticsSummary {
        total_footage_analyzed: footage,
        total_individuals_detected: prev.total_individuals_detected + obs.individual_count as u64,
        average_individuals_per_footage: (prev.average_individuals_per_footage
            + obs.individual_count as f64)
            / footage as f64,
        total_unusual_incidents: prev.total_unusual_incidents + incident(&obs.unusual_activity),
        total_animal_incidents: prev.total_animal_incidents + incident(&obs.animal_activity),
        total_unusual_crowd_incidents: prev.total_unusual_crowd_incidents
            + obs.has_unusual_crowd() as u64,
        total_vehicles_detected: prev.total_vehicles_detected + obs.vehicle_count() as u64,
        ..prev
    }
}

fn incident(field: &str) -> u64 {
    (!is_none_sentinel(field)) as u64
}

/// Keeps one running summary per camera.
pub struct Aggregator {
    store: Arc<dyn AnalyticsStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    pub fn update(&self, camera_id: i64, obs: &Observation) -> Result<AnalyticsSummary> {
        let summary = self.store.upsert_summary(camera_id, &|existing| match existing {
            Some(prev) => fold(prev, obs),
            None => seed(camera_id, obs),
        })?;
        debug!(
            "Analytics camera {}: footage={} individuals={} avg={:.2}",
            camera_id,
            summary.total_footage_analyzed,
            summary.total_individuals_detected,
            summary.average_individuals_per_footage
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::types::sample_observation;

    fn with_count(frame: u64, count: u32) -> Observation {
        let mut obs = sample_observation(1, frame);
        obs.individual_count = count;
        obs
    }

    #[test]
    fn recurrence_matches_documented_example() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let agg = Aggregator::new(db.clone());
        for (frame, count) in [(1, 5), (2, 7), (3, 9)] {
            agg.update(1, &with_count(frame, count)).unwrap();
        }
        let s = db.summary(1).unwrap().unwrap();
        assert_eq!(s.total_footage_analyzed, 3);
        assert_eq!(s.total_individuals_detected, 21);
        // 5 → (5+7)/2 = 6 → (6+9)/3 = 5
        assert!((s.average_individuals_per_footage - 5.0).abs() < 1e-9);
    }

    #[test]
    fn incident_counters() {
        let mut obs = sample_observation(1, 1);
        obs.unusual_activity = "someone climbing the fence".into();
        obs.animal_activity = "None".into();
        obs.unusual_crowd = "a crowd gathering".into();
        obs.vehicle_details = "black suv, blue hatchback, motorbike".into();

        let s = seed(1, &obs);
        assert_eq!(s.total_unusual_incidents, 1);
        assert_eq!(s.total_animal_incidents, 0);
        assert_eq!(s.total_unusual_crowd_incidents, 1);
        assert_eq!(s.total_vehicles_detected, 3);

        let s = fold(s, &sample_observation(1, 2));
        assert_eq!(s.total_footage_analyzed, 2);
        assert_eq!(s.total_unusual_incidents, 1);
        assert_eq!(s.total_vehicles_detected, 3);
    }

    #[test]
    fn cameras_are_independent() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let agg = Aggregator::new(db.clone());
        agg.update(1, &with_count(1, 4)).unwrap();
        agg.update(2, &with_count(1, 8)).unwrap();
        assert_eq!(db.summary(1).unwrap().unwrap().total_individuals_detected, 4);
        assert_eq!(db.summary(2).unwrap().unwrap().total_footage_analyzed, 1);
        assert!(db.summary(3).unwrap().is_none());
    }

    #[test]
    fn created_at_is_kept_across_updates() {
        let first = seed(1, &with_count(1, 1));
        let created = first.created_at;
        let next = fold(first, &with_count(2, 2));
        assert_eq!(next.created_at, created);
    }
}
