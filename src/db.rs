/// Watchdog database: SQLite persistence
///
/// Cameras (read side), append-only observations, per-camera analytics,
/// alerts and chat history. One connection behind a mutex; every write is
/// its own short transaction so the caption worker and CLI callers can
/// interleave safely.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::StreamError;
use crate::types::{
    Alert, AlertType, AnalyticsSummary, Camera, ChatTurn, NewAlert, NewCamera, Observation,
    ObservationField, StoredObservation, TimeOfDay, ALERT_STATUS_UNACKNOWLEDGED,
};

// ─── Store contracts ────────────────────────────────────────────────────────

/// Append-only observation log.
pub trait ObservationStore: Send + Sync {
    /// Fails when `(camera_id, frame_number)` already exists.
    fn append(&self, observation: &Observation) -> Result<StoredObservation>;

    /// Most recent first (descending frame number).
    fn list(&self, camera_id: i64, limit: usize) -> Result<Vec<StoredObservation>>;

    fn filter(
        &self,
        camera_id: i64,
        field: ObservationField,
        predicate: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<StoredObservation>>;
}

pub trait AnalyticsStore: Send + Sync {
    /// Read-modify-write of one camera's summary inside a single transaction.
    fn upsert_summary(
        &self,
        camera_id: i64,
        apply: &dyn Fn(Option<AnalyticsSummary>) -> AnalyticsSummary,
    ) -> Result<AnalyticsSummary>;

    fn summary(&self, camera_id: i64) -> Result<Option<AnalyticsSummary>>;
}

pub trait AlertStore: Send + Sync {
    /// Persist all alerts of one observation together.
    fn insert_alerts(&self, alerts: &[NewAlert]) -> Result<Vec<Alert>>;

    /// Newest first, optionally for one camera.
    fn list_alerts(&self, camera_id: Option<i64>, limit: usize) -> Result<Vec<Alert>>;
}

pub trait ChatStore: Send + Sync {
    fn append_chat(
        &self,
        camera_id: i64,
        question: &str,
        answer: &str,
        frames: &[u64],
    ) -> Result<ChatTurn>;

    fn list_chats(&self, camera_id: i64, limit: usize) -> Result<Vec<ChatTurn>>;
}

/// Read-only camera lookups used by the stream controller and alerting.
pub trait CameraRegistry: Send + Sync {
    /// The single camera flagged for monitoring.
    fn monitored_camera(&self) -> Result<Camera, StreamError>;

    fn camera(&self, camera_id: i64) -> Result<Option<Camera>>;
}

// ─── SQLite implementation ──────────────────────────────────────────────────

pub struct Database {
    conn: Mutex<Connection>,
}

const OBSERVATION_COLUMNS: &str = "id, recorded_at, camera_id, frame_number,
    unusual_activity, human_activity, animal_activity, time_of_day, unusual_crowd,
    lighting_conditions, vehicle_details, individual_count, object_presence, context_notes";

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        // Resolve relative paths to local app data
        let resolved = resolve_db_path(path);
        let conn = Connection::open(&resolved)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn migrate(&self) -> Result<()> {
        self.lock()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cameras (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT    NOT NULL UNIQUE,
                monitoring  INTEGER NOT NULL DEFAULT 0,
                email       TEXT    NOT NULL,
                live        INTEGER NOT NULL DEFAULT 0,
                url         TEXT    NOT NULL,
                start_time  TEXT    NOT NULL
            );

            CREATE TABLE IF NOT EXISTS observations (
                id                   INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at          TEXT    NOT NULL,
                camera_id            INTEGER NOT NULL,
                frame_number         INTEGER NOT NULL,
                unusual_activity     TEXT    NOT NULL,
                human_activity       TEXT    NOT NULL,
                animal_activity      TEXT    NOT NULL,
                time_of_day          TEXT    NOT NULL,
                unusual_crowd        TEXT    NOT NULL,
                lighting_conditions  TEXT    NOT NULL,
                vehicle_details      TEXT    NOT NULL,
                individual_count     INTEGER NOT NULL,
                object_presence      TEXT    NOT NULL,
                context_notes        TEXT    NOT NULL,
                UNIQUE (camera_id, frame_number)
            );

            CREATE TABLE IF NOT EXISTS analytics (
                camera_id                        INTEGER PRIMARY KEY,
                total_footage_analyzed           INTEGER NOT NULL,
                total_individuals_detected       INTEGER NOT NULL,
                average_individuals_per_footage  REAL    NOT NULL,
                total_unusual_incidents          INTEGER NOT NULL,
                total_animal_incidents           INTEGER NOT NULL,
                total_unusual_crowd_incidents    INTEGER NOT NULL,
                total_vehicles_detected          INTEGER NOT NULL,
                created_at                       TEXT    NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_id     INTEGER NOT NULL,
                frame_number  INTEGER NOT NULL,
                alert_type    TEXT    NOT NULL,
                description   TEXT    NOT NULL,
                timestamp     TEXT    NOT NULL,
                status        TEXT    NOT NULL DEFAULT 'unacknowledged'
            );

            CREATE TABLE IF NOT EXISTS chats (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_id  INTEGER NOT NULL,
                question   TEXT    NOT NULL,
                answer     TEXT    NOT NULL,
                frames     TEXT    NOT NULL,
                asked_at   TEXT    NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_cam ON alerts (camera_id, id);
            CREATE INDEX IF NOT EXISTS idx_chats_cam  ON chats (camera_id, id);
        ",
        )?;
        Ok(())
    }

    // ─── Cameras ────────────────────────────────────────────────────────────

    pub fn add_camera(&self, camera: &NewCamera) -> Result<Camera> {
        let conn = self.lock()?;
        let start_time = Utc::now();
        conn.execute(
            "INSERT INTO cameras (name, monitoring, email, live, url, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                camera.name,
                camera.monitoring,
                camera.email,
                camera.live,
                camera.url,
                start_time.to_rfc3339(),
            ],
        )?;
        Ok(Camera {
            id: conn.last_insert_rowid(),
            name: camera.name.clone(),
            url: camera.url.clone(),
            email: camera.email.clone(),
            monitoring: camera.monitoring,
            live: camera.live,
            start_time,
        })
    }

    pub fn list_cameras(&self) -> Result<Vec<Camera>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, url, email, monitoring, live, start_time
             FROM cameras ORDER BY id",
        )?;
        let rows = stmt.query_map([], map_camera)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

impl CameraRegistry for Database {
    fn monitored_camera(&self) -> Result<Camera, StreamError> {
        let conn = self
            .lock()
            .map_err(|e| StreamError::Registry(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, url, email, monitoring, live, start_time
                 FROM cameras WHERE monitoring = 1 ORDER BY id",
            )
            .map_err(|e| StreamError::Registry(e.to_string()))?;
        let mut cameras = stmt
            .query_map([], map_camera)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| StreamError::Registry(e.to_string()))?;

        match cameras.len() {
            0 => Err(StreamError::NoMonitoredCamera),
            1 => Ok(cameras.remove(0)),
            _ => Err(StreamError::MultipleMonitoredCameras(
                cameras.iter().map(|c| c.id).collect(),
            )),
        }
    }

    fn camera(&self, camera_id: i64) -> Result<Option<Camera>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT id, name, url, email, monitoring, live, start_time
                 FROM cameras WHERE id = ?1",
                params![camera_id],
                map_camera,
            )
            .optional()?)
    }
}

impl ObservationStore for Database {
    fn append(&self, obs: &Observation) -> Result<StoredObservation> {
        let conn = self.lock()?;
        let recorded_at = Utc::now();
        conn.execute(
            "INSERT INTO observations
             (recorded_at, camera_id, frame_number, unusual_activity, human_activity,
              animal_activity, time_of_day, unusual_crowd, lighting_conditions,
              vehicle_details, individual_count, object_presence, context_notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                recorded_at.to_rfc3339(),
                obs.camera_id,
                obs.frame_number as i64,
                obs.unusual_activity,
                obs.human_activity,
                obs.animal_activity,
                obs.time_of_day.as_str(),
                obs.unusual_crowd,
                obs.lighting_conditions,
                obs.vehicle_details,
                obs.individual_count,
                obs.object_presence,
                obs.context_notes,
            ],
        )?;
        Ok(StoredObservation {
            id: conn.last_insert_rowid(),
            recorded_at,
            observation: obs.clone(),
        })
    }

    fn list(&self, camera_id: i64, limit: usize) -> Result<Vec<StoredObservation>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM observations WHERE camera_id = ?1
             ORDER BY frame_number DESC LIMIT ?2",
            OBSERVATION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![camera_id, limit as i64], map_observation)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn filter(
        &self,
        camera_id: i64,
        field: ObservationField,
        predicate: &dyn Fn(&str) -> bool,
    ) -> Result<Vec<StoredObservation>> {
        let all = self.list(camera_id, i64::MAX as usize)?;
        Ok(all
            .into_iter()
            .filter(|s| predicate(s.observation.field(field)))
            .collect())
    }
}

impl AnalyticsStore for Database {
    fn upsert_summary(
        &self,
        camera_id: i64,
        apply: &dyn Fn(Option<AnalyticsSummary>) -> AnalyticsSummary,
    ) -> Result<AnalyticsSummary> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                "SELECT camera_id, total_footage_analyzed, total_individuals_detected,
                        average_individuals_per_footage, total_unusual_incidents,
                        total_animal_incidents, total_unusual_crowd_incidents,
                        total_vehicles_detected, created_at
                 FROM analytics WHERE camera_id = ?1",
                params![camera_id],
                map_summary,
            )
            .optional()?;

        let next = apply(existing);
        tx.execute(
            "INSERT INTO analytics
             (camera_id, total_footage_analyzed, total_individuals_detected,
              average_individuals_per_footage, total_unusual_incidents,
              total_animal_incidents, total_unusual_crowd_incidents,
              total_vehicles_detected, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(camera_id) DO UPDATE SET
                total_footage_analyzed          = excluded.total_footage_analyzed,
                total_individuals_detected      = excluded.total_individuals_detected,
                average_individuals_per_footage = excluded.average_individuals_per_footage,
                total_unusual_incidents         = excluded.total_unusual_incidents,
                total_animal_incidents          = excluded.total_animal_incidents,
                total_unusual_crowd_incidents   = excluded.total_unusual_crowd_incidents,
                total_vehicles_detected         = excluded.total_vehicles_detected",
            params![
                next.camera_id,
                next.total_footage_analyzed as i64,
                next.total_individuals_detected as i64,
                next.average_individuals_per_footage,
                next.total_unusual_incidents as i64,
                next.total_animal_incidents as i64,
                next.total_unusual_crowd_incidents as i64,
                next.total_vehicles_detected as i64,
                next.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn summary(&self, camera_id: i64) -> Result<Option<AnalyticsSummary>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT camera_id, total_footage_analyzed, total_individuals_detected,
                        average_individuals_per_footage, total_unusual_incidents,
                        total_animal_incidents, total_unusual_crowd_incidents,
                        total_vehicles_detected, created_at
                 FROM analytics WHERE camera_id = ?1",
                params![camera_id],
                map_summary,
            )
            .optional()?)
    }
}

impl AlertStore for Database {
    fn insert_alerts(&self, alerts: &[NewAlert]) -> Result<Vec<Alert>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let timestamp = Utc::now();
        let mut out = Vec::with_capacity(alerts.len());
        for alert in alerts {
            tx.execute(
                "INSERT INTO alerts (camera_id, frame_number, alert_type, description, timestamp, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    alert.camera_id,
                    alert.frame_number as i64,
                    alert.alert_type.as_str(),
                    alert.description,
                    timestamp.to_rfc3339(),
                    ALERT_STATUS_UNACKNOWLEDGED,
                ],
            )?;
            out.push(Alert {
                id: tx.last_insert_rowid(),
                camera_id: alert.camera_id,
                frame_number: alert.frame_number,
                alert_type: alert.alert_type,
                description: alert.description.clone(),
                timestamp,
                status: ALERT_STATUS_UNACKNOWLEDGED.to_string(),
            });
        }
        tx.commit()?;
        Ok(out)
    }

    fn list_alerts(&self, camera_id: Option<i64>, limit: usize) -> Result<Vec<Alert>> {
        let conn = self.lock()?;
        let base = "SELECT id, camera_id, frame_number, alert_type, description, timestamp, status
                    FROM alerts";
        let rows = match camera_id {
            Some(cam) => {
                let mut stmt =
                    conn.prepare(&format!("{} WHERE camera_id = ?1 ORDER BY id DESC LIMIT ?2", base))?;
                let rows = stmt.query_map(params![cam, limit as i64], map_alert)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("{} ORDER BY id DESC LIMIT ?1", base))?;
                let rows = stmt.query_map(params![limit as i64], map_alert)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }
}

impl ChatStore for Database {
    fn append_chat(
        &self,
        camera_id: i64,
        question: &str,
        answer: &str,
        frames: &[u64],
    ) -> Result<ChatTurn> {
        let conn = self.lock()?;
        let asked_at = Utc::now();
        conn.execute(
            "INSERT INTO chats (camera_id, question, answer, frames, asked_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                camera_id,
                question,
                answer,
                serde_json::to_string(frames)?,
                asked_at.to_rfc3339(),
            ],
        )?;
        Ok(ChatTurn {
            id: conn.last_insert_rowid(),
            camera_id,
            question: question.to_string(),
            answer: answer.to_string(),
            frames: frames.to_vec(),
            asked_at,
        })
    }

    fn list_chats(&self, camera_id: i64, limit: usize) -> Result<Vec<ChatTurn>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, camera_id, question, answer, frames, asked_at
             FROM chats WHERE camera_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![camera_id, limit as i64], |row| {
            let frames_json: String = row.get(4)?;
            let frames: Vec<u64> = serde_json::from_str(&frames_json)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;
            Ok(ChatTurn {
                id: row.get(0)?,
                camera_id: row.get(1)?,
                question: row.get(2)?,
                answer: row.get(3)?,
                frames,
                asked_at: parse_ts(&row.get::<_, String>(5)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ─── Row mappers ────────────────────────────────────────────────────────────

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(Utc::now())
}

fn map_camera(row: &rusqlite::Row<'_>) -> rusqlite::Result<Camera> {
    Ok(Camera {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        email: row.get(3)?,
        monitoring: row.get(4)?,
        live: row.get(5)?,
        start_time: parse_ts(&row.get::<_, String>(6)?),
    })
}

fn map_observation(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredObservation> {
    let time_of_day: String = row.get(7)?;
    Ok(StoredObservation {
        id: row.get(0)?,
        recorded_at: parse_ts(&row.get::<_, String>(1)?),
        observation: Observation {
            camera_id: row.get(2)?,
            frame_number: row.get::<_, i64>(3)? as u64,
            unusual_activity: row.get(4)?,
            human_activity: row.get(5)?,
            animal_activity: row.get(6)?,
            time_of_day: TimeOfDay::parse_lenient(&time_of_day),
            unusual_crowd: row.get(8)?,
            lighting_conditions: row.get(9)?,
            vehicle_details: row.get(10)?,
            individual_count: row.get(11)?,
            object_presence: row.get(12)?,
            context_notes: row.get(13)?,
        },
    })
}

fn map_summary(row: &rusqlite::Row<'_>) -> rusqlite::Result<AnalyticsSummary> {
    Ok(AnalyticsSummary {
        camera_id: row.get(0)?,
        total_footage_analyzed: row.get::<_, i64>(1)? as u64,
        total_individuals_detected: row.get::<_, i64>(2)? as u64,
        average_individuals_per_footage: row.get(3)?,
        total_unusual_incidents: row.get::<_, i64>(4)? as u64,
        total_animal_incidents: row.get::<_, i64>(5)? as u64,
        total_unusual_crowd_incidents: row.get::<_, i64>(6)? as u64,
        total_vehicles_detected: row.get::<_, i64>(7)? as u64,
        created_at: parse_ts(&row.get::<_, String>(8)?),
    })
}

fn map_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alert> {
    let raw_type: String = row.get(3)?;
    let alert_type = AlertType::parse(&raw_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown alert type {:?}", raw_type),
            )),
        )
    })?;
    Ok(Alert {
        id: row.get(0)?,
        camera_id: row.get(1)?,
        frame_number: row.get::<_, i64>(2)? as u64,
        alert_type,
        description: row.get(4)?,
        timestamp: parse_ts(&row.get::<_, String>(5)?),
        status: row.get(6)?,
    })
}

/// Resolve bare DB filenames to the local app data directory.
fn resolve_db_path(db_path: &str) -> String {
    if db_path == ":memory:" || Path::new(db_path).is_absolute() {
        return db_path.to_string();
    }
    if let Some(data_dir) = dirs::data_local_dir() {
        let full = data_dir.join("watchdog").join(db_path);
        if let Some(parent) = full.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return full.to_string_lossy().to_string();
    }
    db_path.to_string()
}
