//! Domain records shared by the pipeline, the store and the chat engine.
//!
//! Observations are immutable once written; analytics rows are the only
//! records mutated in place, and only through the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel the captioning model uses for "nothing observed".
pub const NONE_SENTINEL: &str = "none";

/// True when a free-text field carries the "none" sentinel (or nothing at all).
pub fn is_none_sentinel(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v.eq_ignore_ascii_case(NONE_SENTINEL)
}

// ─── Camera registry ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Camera {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub email: String,
    pub monitoring: bool,
    pub live: bool,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCamera {
    pub name: String,
    pub url: String,
    pub email: String,
    pub monitoring: bool,
    pub live: bool,
}

// ─── Observations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Day,
    Night,
}

impl TimeOfDay {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeOfDay::Day => "day",
            TimeOfDay::Night => "night",
        }
    }

    /// Lenient parse of the model's `time` answer.
    pub fn parse_lenient(raw: &str) -> Self {
        if raw.to_lowercase().contains("night") {
            TimeOfDay::Night
        } else {
            TimeOfDay::Day
        }
    }
}

/// Structured result of captioning one keyframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub camera_id: i64,
    pub frame_number: u64,
    pub unusual_activity: String,
    pub human_activity: String,
    pub animal_activity: String,
    pub time_of_day: TimeOfDay,
    pub unusual_crowd: String,
    pub lighting_conditions: String,
    pub vehicle_details: String,
    pub individual_count: u32,
    pub object_presence: String,
    pub context_notes: String,
}

impl Observation {
    pub fn has_unusual_crowd(&self) -> bool {
        !is_none_sentinel(&self.unusual_crowd)
    }

    /// Number of comma-separated vehicle descriptions; 0 for the sentinel.
    pub fn vehicle_count(&self) -> u32 {
        if is_none_sentinel(&self.vehicle_details) {
            return 0;
        }
        self.vehicle_details
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .count() as u32
    }

    /// Free text used for retrieval: every populated descriptive field.
    pub fn description(&self) -> String {
        [
            &self.human_activity,
            &self.unusual_activity,
            &self.animal_activity,
            &self.vehicle_details,
            &self.object_presence,
            &self.context_notes,
        ]
        .iter()
        .filter(|v| !is_none_sentinel(v))
        .map(|v| v.trim().trim_end_matches('.'))
        .collect::<Vec<_>>()
        .join(". ")
    }

    pub fn field(&self, field: ObservationField) -> &str {
        field.get(self)
    }
}

/// An observation as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredObservation {
    pub id: i64,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub observation: Observation,
}

/// Addressable text columns of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObservationField {
    UnusualActivity,
    HumanActivity,
    AnimalActivity,
    TimeOfDay,
    UnusualCrowd,
    LightingConditions,
    VehicleDetails,
    ObjectPresence,
    ContextNotes,
}

impl ObservationField {
    pub const ALL: [ObservationField; 9] = [
        ObservationField::UnusualActivity,
        ObservationField::HumanActivity,
        ObservationField::AnimalActivity,
        ObservationField::TimeOfDay,
        ObservationField::UnusualCrowd,
        ObservationField::LightingConditions,
        ObservationField::VehicleDetails,
        ObservationField::ObjectPresence,
        ObservationField::ContextNotes,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            ObservationField::UnusualActivity => "unusual_activity",
            ObservationField::HumanActivity => "human_activity",
            ObservationField::AnimalActivity => "animal_activity",
            ObservationField::TimeOfDay => "time_of_day",
            ObservationField::UnusualCrowd => "unusual_crowd",
            ObservationField::LightingConditions => "lighting_conditions",
            ObservationField::VehicleDetails => "vehicle_details",
            ObservationField::ObjectPresence => "object_presence",
            ObservationField::ContextNotes => "context_notes",
        }
    }

    pub fn from_column(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.column() == name)
    }

    pub fn get<'a>(&self, obs: &'a Observation) -> &'a str {
        match self {
            ObservationField::UnusualActivity => &obs.unusual_activity,
            ObservationField::HumanActivity => &obs.human_activity,
            ObservationField::AnimalActivity => &obs.animal_activity,
            ObservationField::TimeOfDay => obs.time_of_day.as_str(),
            ObservationField::UnusualCrowd => &obs.unusual_crowd,
            ObservationField::LightingConditions => &obs.lighting_conditions,
            ObservationField::VehicleDetails => &obs.vehicle_details,
            ObservationField::ObjectPresence => &obs.object_presence,
            ObservationField::ContextNotes => &obs.context_notes,
        }
    }
}

// ─── Analytics ──────────────────────────────────────────────────────────────

/// Running per-camera aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSummary {
    pub camera_id: i64,
    pub total_footage_analyzed: u64,
    pub total_individuals_detected: u64,
    pub average_individuals_per_footage: f64,
    pub total_unusual_incidents: u64,
    pub total_animal_incidents: u64,
    pub total_unusual_crowd_incidents: u64,
    pub total_vehicles_detected: u64,
    pub created_at: DateTime<Utc>,
}

// ─── Alerts ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertType {
    HumanActivity,
    UnusualActivity,
    AnimalActivity,
    UnusualCrowdActivity,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HumanActivity => "Human Activity",
            AlertType::UnusualActivity => "Unusual Activity",
            AlertType::AnimalActivity => "Animal Activity",
            AlertType::UnusualCrowdActivity => "Unusual Crowd Activity",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Human Activity" => Some(AlertType::HumanActivity),
            "Unusual Activity" => Some(AlertType::UnusualActivity),
            "Animal Activity" => Some(AlertType::AnimalActivity),
            "Unusual Crowd Activity" => Some(AlertType::UnusualCrowdActivity),
            _ => None,
        }
    }
}

pub const ALERT_STATUS_UNACKNOWLEDGED: &str = "unacknowledged";

/// Alert about to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub camera_id: i64,
    pub frame_number: u64,
    pub alert_type: AlertType,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: i64,
    pub camera_id: i64,
    pub frame_number: u64,
    pub alert_type: AlertType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

// ─── Chat ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: i64,
    pub camera_id: i64,
    pub question: String,
    pub answer: String,
    pub frames: Vec<u64>,
    pub asked_at: DateTime<Utc>,
}

#[cfg(test)]
pub(crate) fn sample_observation(camera_id: i64, frame_number: u64) -> Observation {
    Observation {
        camera_id,
        frame_number,
        unusual_activity: "none".into(),
        human_activity: "none".into(),
        animal_activity: "none".into(),
        time_of_day: TimeOfDay::Day,
        unusual_crowd: "none".into(),
        lighting_conditions: "well-lit".into(),
        vehicle_details: "none".into(),
        individual_count: 0,
        object_presence: "none".into(),
        context_notes: "none".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_case_insensitive() {
        assert!(is_none_sentinel("none"));
        assert!(is_none_sentinel(" None "));
        assert!(is_none_sentinel(""));
        assert!(!is_none_sentinel("a dog"));
    }

    #[test]
    fn vehicle_count_splits_on_commas() {
        let mut obs = sample_observation(1, 1);
        assert_eq!(obs.vehicle_count(), 0);
        obs.vehicle_details = "red sedan, white van,  ".into();
        assert_eq!(obs.vehicle_count(), 2);
        obs.vehicle_details = "a bus".into();
        assert_eq!(obs.vehicle_count(), 1);
    }

    #[test]
    fn description_skips_sentinels() {
        let mut obs = sample_observation(1, 1);
        obs.human_activity = "Two people walking.".into();
        obs.context_notes = "Street corner".into();
        assert_eq!(obs.description(), "Two people walking. Street corner");
    }

    #[test]
    fn field_lookup_round_trips_columns() {
        for field in ObservationField::ALL {
            assert_eq!(ObservationField::from_column(field.column()), Some(field));
        }
        assert_eq!(ObservationField::from_column("frame_number"), None);
        let obs = sample_observation(1, 1);
        assert_eq!(obs.field(ObservationField::LightingConditions), "well-lit");
        assert_eq!(obs.field(ObservationField::TimeOfDay), "day");
    }

    #[test]
    fn time_of_day_lenient() {
        assert_eq!(TimeOfDay::parse_lenient("Night"), TimeOfDay::Night);
        assert_eq!(TimeOfDay::parse_lenient("late night, dim"), TimeOfDay::Night);
        assert_eq!(TimeOfDay::parse_lenient("day"), TimeOfDay::Day);
    }
}
