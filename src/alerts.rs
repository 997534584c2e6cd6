//! Rule-based alerts derived from each new observation.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::db::{AlertStore, CameraRegistry};
use crate::notify::Notifier;
use crate::types::{is_none_sentinel, Alert, AlertType, NewAlert, Observation, ObservationField};

/// (alert type, field it watches, description prefix), in evaluation order.
const RULES: [(AlertType, ObservationField, &str); 4] = [
    (
        AlertType::HumanActivity,
        ObservationField::HumanActivity,
        "Human activity detected",
    ),
    (
        AlertType::UnusualActivity,
        ObservationField::UnusualActivity,
        "Unusual activity detected",
    ),
    (
        AlertType::AnimalActivity,
        ObservationField::AnimalActivity,
        "Animal activity detected",
    ),
    (
        AlertType::UnusualCrowdActivity,
        ObservationField::UnusualCrowd,
        "Unusual crowd activity detected",
    ),
];

/// Alerts that `obs` triggers, not yet persisted.
pub fn derive_alerts(camera_id: i64, frame_number: u64, obs: &Observation) -> Vec<NewAlert> {
    RULES
        .iter()
        .filter_map(|(alert_type, field, prefix)| {
            let value = obs.field(*field);
            (!is_none_sentinel(value)).then(|| NewAlert {
                camera_id,
                frame_number,
                alert_type: *alert_type,
                description: format!("{}: {}", prefix, value.trim()),
            })
        })
        .collect()
}

pub struct AlertEngine {
    store: Arc<dyn AlertStore>,
    registry: Arc<dyn CameraRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<dyn AlertStore>,
        registry: Arc<dyn CameraRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
        }
    }

    /// Persist the alerts `obs` triggers and send one notification for them.
    ///
    /// Notification problems are logged only; committed alerts stay.
    pub fn evaluate(&self, camera_id: i64, frame_number: u64, obs: &Observation) -> Result<Vec<Alert>> {
        let pending = derive_alerts(camera_id, frame_number, obs);
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let alerts = self.store.insert_alerts(&pending)?;
        info!(
            "Camera {} frame {}: {} alert(s) raised",
            camera_id,
            frame_number,
            alerts.len()
        );

        let descriptions: Vec<String> = alerts.iter().map(|a| a.description.clone()).collect();
        match self.registry.camera(camera_id) {
            Ok(Some(camera)) => {
                if let Err(e) = self.notifier.notify(&camera, &descriptions) {
                    error!("Notification for camera {} failed: {:#}", camera_id, e);
                }
            }
            Ok(None) => warn!("Camera {} not registered; alert notification skipped", camera_id),
            Err(e) => error!("Camera lookup for notification failed: {:#}", e),
        }

        Ok(alerts)
    }
}
