//! Stream controller: owns the single ingestion session.
//!
//! `Idle → Running` on start, `Running → Idle` on stop and
//! `Running → Running` on change. Rejected transitions leave the state
//! untouched. The ingestion loop runs on its own thread, checks the stop
//! flag once per frame and releases its source exactly once on exit.
//! Stopping interrupts a blocked read and waits at most [`STOP_GRACE`]
//! for the loop to exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::change_detector::ChangeDetector;
use crate::config::DetectorConfig;
use crate::db::{CameraRegistry, ObservationStore};
use crate::dispatcher::CaptionDispatcher;
use crate::error::StreamError;
use crate::frame::{Interrupter, SourceOpener, VideoSource};

/// How long `stop` waits for the ingestion thread after interrupting it.
pub const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Running {
        camera_id: i64,
        source_url: String,
        started_at: DateTime<Utc>,
        frames_read: u64,
        keyframes_dispatched: u64,
        /// The loop ended by itself (source exhausted or failed).
        finished: bool,
    },
}

/// Final counters of a session that was stopped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub camera_id: i64,
    pub source_url: String,
    pub frames_read: u64,
    pub keyframes_dispatched: u64,
}

#[derive(Default)]
struct SessionStats {
    frames_read: AtomicU64,
    keyframes_dispatched: AtomicU64,
    last_frame_number: AtomicU64,
    finished: AtomicBool,
}

struct ActiveSession {
    camera_id: i64,
    source_url: String,
    started_at: DateTime<Utc>,
    stop_tx: watch::Sender<bool>,
    interrupter: Option<Interrupter>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<SessionStats>,
}

impl ActiveSession {
    fn is_finished(&self) -> bool {
        self.stats.finished.load(Ordering::SeqCst)
    }

    /// Signal the loop, unblock its read and wait for it to release its source.
    fn stop(mut self) -> SessionSummary {
        let _ = self.stop_tx.send(true);
        if let Some(interrupter) = &self.interrupter {
            interrupter.interrupt();
        }
        if let Some(thread) = self.thread.take() {
            let deadline = Instant::now() + STOP_GRACE;
            while !thread.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if !thread.is_finished() {
                // The loop discards whatever the stalled read returns and
                // releases the source on its own exit path.
                warn!(
                    "Ingestion thread for camera {} still blocked after {:?}, detaching",
                    self.camera_id, STOP_GRACE
                );
            } else if thread.join().is_err() {
                error!("Ingestion thread for camera {} panicked", self.camera_id);
            }
        }
        SessionSummary {
            camera_id: self.camera_id,
            source_url: self.source_url,
            frames_read: self.stats.frames_read.load(Ordering::SeqCst),
            keyframes_dispatched: self.stats.keyframes_dispatched.load(Ordering::SeqCst),
        }
    }
}

enum SessionState {
    Idle,
    Running(ActiveSession),
}

pub struct StreamController {
    registry: Arc<dyn CameraRegistry>,
    store: Arc<dyn ObservationStore>,
    opener: Arc<dyn SourceOpener>,
    dispatcher: CaptionDispatcher,
    detector: DetectorConfig,
    state: SessionState,
    /// Highest frame number handed out per camera, across sessions.
    last_frame: HashMap<i64, u64>,
}

impl StreamController {
    pub fn new(
        registry: Arc<dyn CameraRegistry>,
        store: Arc<dyn ObservationStore>,
        opener: Arc<dyn SourceOpener>,
        dispatcher: CaptionDispatcher,
        detector: DetectorConfig,
    ) -> Self {
        Self {
            registry,
            store,
            opener,
            dispatcher,
            detector,
            state: SessionState::Idle,
            last_frame: HashMap::new(),
        }
    }

    /// Start ingesting the camera currently flagged for monitoring.
    pub fn start(&mut self) -> Result<StreamStatus, StreamError> {
        self.reap_finished();
        self.ensure_idle()?;
        let camera = self.registry.monitored_camera()?;
        self.start_source(camera.id, &camera.url)
    }

    /// Start ingesting an explicit source for `camera_id`.
    pub fn start_source(
        &mut self,
        camera_id: i64,
        source_url: &str,
    ) -> Result<StreamStatus, StreamError> {
        self.reap_finished();
        self.ensure_idle()?;
        let source = self.open_source(source_url)?;
        self.launch(camera_id, source_url, source)
    }

    fn open_source(&self, source_url: &str) -> Result<Box<dyn VideoSource>, StreamError> {
        self.opener
            .open(source_url)
            .map_err(|e| StreamError::SourceOpen {
                source_url: source_url.to_string(),
                reason: format!("{:#}", e),
            })
    }

    fn launch(
        &mut self,
        camera_id: i64,
        source_url: &str,
        source: Box<dyn VideoSource>,
    ) -> Result<StreamStatus, StreamError> {
        let interrupter = source.interrupter();
        let guard = SourceGuard::new(source);

        let first_frame = self.next_frame_number(camera_id);
        let stats = Arc::new(SessionStats::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let ingest = Ingestion {
            camera_id,
            detector: ChangeDetector::new(&self.detector),
            dispatcher: self.dispatcher.clone(),
            stop_rx,
            stats: Arc::clone(&stats),
            first_frame,
        };
        let thread = std::thread::Builder::new()
            .name(format!("ingest-{}", camera_id))
            .spawn(move || ingest.run(guard))
            .map_err(|e| StreamError::SourceOpen {
                source_url: source_url.to_string(),
                reason: format!("cannot spawn ingestion thread: {}", e),
            })?;

        info!(
            "Stream started: camera {} source {} (from frame {})",
            camera_id, source_url, first_frame
        );
        self.state = SessionState::Running(ActiveSession {
            camera_id,
            source_url: source_url.to_string(),
            started_at: Utc::now(),
            stop_tx,
            interrupter,
            thread: Some(thread),
            stats,
        });
        Ok(self.status())
    }

    /// Stop the active session. Fails when idle.
    pub fn stop(&mut self) -> Result<SessionSummary, StreamError> {
        match std::mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Idle => Err(StreamError::NotRunning),
            SessionState::Running(session) => {
                let summary = self.finish(session);
                info!(
                    "Stream stopped: camera {} after {} frames, {} keyframes",
                    summary.camera_id, summary.frames_read, summary.keyframes_dispatched
                );
                Ok(summary)
            }
        }
    }

    /// Switch the running session to another source for the same camera.
    /// The new source is opened first; if that fails the current session
    /// keeps running.
    pub fn change(&mut self, source_url: &str) -> Result<StreamStatus, StreamError> {
        let camera_id = match &self.state {
            SessionState::Idle => return Err(StreamError::NotRunning),
            SessionState::Running(session) => session.camera_id,
        };
        let source = self.open_source(source_url)?;
        self.stop()?;
        self.launch(camera_id, source_url, source)
    }

    pub fn status(&self) -> StreamStatus {
        match &self.state {
            SessionState::Idle => StreamStatus::Idle,
            SessionState::Running(s) => StreamStatus::Running {
                camera_id: s.camera_id,
                source_url: s.source_url.clone(),
                started_at: s.started_at,
                frames_read: s.stats.frames_read.load(Ordering::SeqCst),
                keyframes_dispatched: s.stats.keyframes_dispatched.load(Ordering::SeqCst),
                finished: s.is_finished(),
            },
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&self.state, SessionState::Running(s) if !s.is_finished())
    }

    fn ensure_idle(&self) -> Result<(), StreamError> {
        match &self.state {
            SessionState::Idle => Ok(()),
            SessionState::Running(s) => Err(StreamError::AlreadyRunning {
                camera_id: s.camera_id,
                source_url: s.source_url.clone(),
            }),
        }
    }

    fn reap_finished(&mut self) {
        let finished = matches!(&self.state, SessionState::Running(s) if s.is_finished());
        if !finished {
            return;
        }
        if let SessionState::Running(session) =
            std::mem::replace(&mut self.state, SessionState::Idle)
        {
            let summary = self.finish(session);
            debug!(
                "Reaped finished session for camera {} ({} frames)",
                summary.camera_id, summary.frames_read
            );
        }
    }

    fn finish(&mut self, session: ActiveSession) -> SessionSummary {
        let camera_id = session.camera_id;
        let stats = Arc::clone(&session.stats);
        let summary = session.stop();
        let last = stats.last_frame_number.load(Ordering::SeqCst);
        let entry = self.last_frame.entry(camera_id).or_insert(0);
        *entry = (*entry).max(last);
        summary
    }

    /// Continue numbering after anything this camera already produced.
    fn next_frame_number(&self, camera_id: i64) -> u64 {
        let remembered = self.last_frame.get(&camera_id).copied().unwrap_or(0);
        let stored = match self.store.list(camera_id, 1) {
            Ok(rows) => rows.first().map(|s| s.observation.frame_number).unwrap_or(0),
            Err(e) => {
                warn!("Cannot read last frame number for camera {}: {:#}", camera_id, e);
                0
            }
        };
        remembered.max(stored) + 1
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let SessionState::Running(session) =
            std::mem::replace(&mut self.state, SessionState::Idle)
        {
            session.stop();
        }
    }
}

// ─── Ingestion loop ─────────────────────────────────────────────────────────

/// Releases the wrapped source once, on explicit release or drop.
struct SourceGuard {
    source: Option<Box<dyn VideoSource>>,
}

impl SourceGuard {
    fn new(source: Box<dyn VideoSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    fn get(&mut self) -> Option<&mut Box<dyn VideoSource>> {
        self.source.as_mut()
    }

    fn release(&mut self) {
        if let Some(mut source) = self.source.take() {
            debug!("Releasing {}", source.describe());
            source.release();
        }
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct Ingestion {
    camera_id: i64,
    detector: ChangeDetector,
    dispatcher: CaptionDispatcher,
    stop_rx: watch::Receiver<bool>,
    stats: Arc<SessionStats>,
    first_frame: u64,
}

impl Ingestion {
    fn run(mut self, mut guard: SourceGuard) {
        let mut frame_number = self.first_frame;

        loop {
            if *self.stop_rx.borrow() {
                info!("Stop requested for camera {}", self.camera_id);
                break;
            }

            let Some(source) = guard.get() else { break };
            let frame = match source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("Source exhausted for camera {}", self.camera_id);
                    break;
                }
                Err(e) => {
                    warn!("Frame read failed for camera {}: {:#}", self.camera_id, e);
                    break;
                }
            };
            if *self.stop_rx.borrow() {
                debug!("Discarding frame read after stop for camera {}", self.camera_id);
                break;
            }

            self.stats.frames_read.fetch_add(1, Ordering::SeqCst);
            self.stats
                .last_frame_number
                .store(frame_number, Ordering::SeqCst);

            if self.detector.observe(&frame)
                && self.dispatcher.dispatch(&frame, frame_number, self.camera_id)
            {
                self.stats.keyframes_dispatched.fetch_add(1, Ordering::SeqCst);
            }
            frame_number += 1;
        }

        guard.release();
        self.stats.finished.store(true, Ordering::SeqCst);
        info!("Ingestion loop exited for camera {}", self.camera_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptioningConfig;
    use crate::db::Database;
    use crate::dispatcher::CaptionJob;
    use crate::frame::Frame;
    use crate::types::NewCamera;
    use anyhow::Result;
    use image::{Rgb, RgbImage};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    struct FakeSource {
        remaining: Option<u64>,
        produced: u64,
        released: Arc<AtomicUsize>,
        /// Blocks every read until woken (or for a long time).
        stall: Option<(flume::Sender<()>, flume::Receiver<()>)>,
        interruptible: bool,
    }

    impl VideoSource for FakeSource {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            if let Some((_, wake)) = &self.stall {
                let _ = wake.recv_timeout(Duration::from_secs(30));
                return Ok(None);
            }
            if let Some(left) = self.remaining.as_mut() {
                if *left == 0 {
                    return Ok(None);
                }
                *left -= 1;
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.produced += 1;
            let shade = if self.produced % 2 == 0 { 0 } else { 255 };
            Ok(Some(Frame::new(RgbImage::from_pixel(16, 9, Rgb([shade; 3])))))
        }

        fn release(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "fake".into()
        }

        fn interrupter(&self) -> Option<Interrupter> {
            let (tx, _) = self.stall.as_ref().filter(|_| self.interruptible)?;
            let tx = tx.clone();
            Some(Interrupter::new(move || {
                let _ = tx.send(());
            }))
        }
    }

    /// Opens fake sources: "finite:N" yields N frames, "stalled" blocks on
    /// its first read ("stalled:interruptible" can be woken), anything else
    /// is endless.
    #[derive(Default)]
    struct FakeOpener {
        released: Arc<AtomicUsize>,
        opened: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl SourceOpener for FakeOpener {
        fn open(&self, source_url: &str) -> Result<Box<dyn VideoSource>> {
            if source_url == "broken" {
                anyhow::bail!("connection refused");
            }
            self.opened.lock().unwrap().push(source_url.to_string());
            let remaining = source_url
                .strip_prefix("finite:")
                .and_then(|n| n.parse().ok());
            let stall = source_url
                .starts_with("stalled")
                .then(flume::unbounded::<()>);
            Ok(Box::new(FakeSource {
                remaining,
                produced: 0,
                released: Arc::clone(&self.released),
                stall,
                interruptible: source_url == "stalled:interruptible",
            }))
        }
    }

    struct Harness {
        controller: StreamController,
        db: Arc<Database>,
        released: Arc<AtomicUsize>,
        opened: Arc<std::sync::Mutex<Vec<String>>>,
        jobs: flume::Receiver<CaptionJob>,
    }

    fn harness(monitoring: bool) -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.add_camera(&NewCamera {
            name: "door".into(),
            url: "endless".into(),
            email: "a@b.c".into(),
            monitoring,
            live: true,
        })
        .unwrap();
        let opener = FakeOpener::default();
        let released = Arc::clone(&opener.released);
        let opened = Arc::clone(&opener.opened);
        let (tx, jobs) = flume::bounded(10_000);
        let controller = StreamController::new(
            db.clone(),
            db.clone(),
            Arc::new(opener),
            CaptionDispatcher::new(tx, &CaptioningConfig::default()),
            DetectorConfig {
                cooldown_frames: 2,
                ..DetectorConfig::default()
            },
        );
        Harness {
            controller,
            db,
            released,
            opened,
            jobs,
        }
    }

    fn wait_finished(c: &StreamController) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let StreamStatus::Running { finished: true, .. } = c.status() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("session did not finish");
    }

    #[test]
    fn start_while_running_is_rejected_without_side_effects() {
        let mut h = harness(true);
        h.controller.start().unwrap();
        let err = h.controller.start_source(1, "other").unwrap_err();
        assert!(matches!(err, StreamError::AlreadyRunning { .. }));
        assert!(matches!(
            h.controller.start().unwrap_err(),
            StreamError::AlreadyRunning { .. }
        ));
        match h.controller.status() {
            StreamStatus::Running { source_url, .. } => assert_eq!(source_url, "endless"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.opened.lock().unwrap().len(), 1);
        h.controller.stop().unwrap();
    }

    #[test]
    fn stop_when_idle_is_rejected() {
        let mut h = harness(true);
        assert!(matches!(h.controller.stop(), Err(StreamError::NotRunning)));
        assert!(matches!(
            h.controller.change("x"),
            Err(StreamError::NotRunning)
        ));
    }

    #[test]
    fn stop_releases_source_once() {
        let mut h = harness(true);
        h.controller.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let summary = h.controller.stop().unwrap();
        assert!(summary.frames_read > 0);
        assert_eq!(h.released.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.status(), StreamStatus::Idle);
    }

    #[test]
    fn exhaustion_racing_stop_releases_once() {
        let mut h = harness(true);
        h.controller.start_source(1, "finite:20").unwrap();
        wait_finished(&h.controller);
        let summary = h.controller.stop().unwrap();
        assert_eq!(summary.frames_read, 20);
        assert_eq!(h.released.load(Ordering::SeqCst), 1);
        assert!(summary.keyframes_dispatched > 0);
        assert_eq!(h.jobs.len() as u64, summary.keyframes_dispatched);
    }

    #[test]
    fn finished_session_is_reaped_by_next_start() {
        let mut h = harness(true);
        h.controller.start_source(1, "finite:3").unwrap();
        wait_finished(&h.controller);
        assert!(!h.controller.is_running());
        h.controller.start_source(1, "finite:3").unwrap();
        wait_finished(&h.controller);
        h.controller.stop().unwrap();
        assert_eq!(h.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn change_switches_source() {
        let mut h = harness(true);
        h.controller.start().unwrap();
        h.controller.change("finite:5").unwrap();
        assert_eq!(h.released.load(Ordering::SeqCst), 1);
        match h.controller.status() {
            StreamStatus::Running {
                source_url,
                camera_id,
                ..
            } => {
                assert_eq!(source_url, "finite:5");
                assert_eq!(camera_id, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        h.controller.stop().unwrap();
        assert_eq!(h.released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_change_keeps_current_session() {
        let mut h = harness(true);
        h.controller.start().unwrap();
        assert!(matches!(
            h.controller.change("broken"),
            Err(StreamError::SourceOpen { .. })
        ));
        assert!(h.controller.is_running());
        match h.controller.status() {
            StreamStatus::Running { source_url, .. } => assert_eq!(source_url, "endless"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.released.load(Ordering::SeqCst), 0);
        h.controller.stop().unwrap();
        assert_eq!(h.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_interrupts_blocked_read() {
        let mut h = harness(true);
        h.controller.start_source(1, "stalled:interruptible").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        let summary = h.controller.stop().unwrap();
        assert!(started.elapsed() < STOP_GRACE);
        assert_eq!(summary.frames_read, 0);
        assert_eq!(h.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_gives_up_on_uninterruptible_read() {
        let mut h = harness(true);
        h.controller.start_source(1, "stalled").unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        h.controller.stop().unwrap();
        assert!(started.elapsed() < STOP_GRACE + Duration::from_secs(1));
        assert_eq!(h.controller.status(), StreamStatus::Idle);
        assert!(h.jobs.is_empty());
    }

    #[test]
    fn missing_monitored_camera_is_rejected() {
        let mut h = harness(false);
        assert!(matches!(
            h.controller.start(),
            Err(StreamError::NoMonitoredCamera)
        ));
        assert_eq!(h.controller.status(), StreamStatus::Idle);
    }

    #[test]
    fn open_failure_leaves_controller_idle() {
        let mut h = harness(true);
        assert!(matches!(
            h.controller.start_source(1, "broken"),
            Err(StreamError::SourceOpen { .. })
        ));
        assert_eq!(h.controller.status(), StreamStatus::Idle);
    }

    #[test]
    fn frame_numbers_continue_across_sessions() {
        let mut h = harness(true);
        h.controller.start_source(1, "finite:10").unwrap();
        wait_finished(&h.controller);
        h.controller.stop().unwrap();
        let first: Vec<u64> = h.jobs.drain().map(|j| j.frame_number).collect();

        h.controller.start_source(1, "finite:10").unwrap();
        wait_finished(&h.controller);
        h.controller.stop().unwrap();
        let second: Vec<u64> = h.jobs.drain().map(|j| j.frame_number).collect();

        assert!(!first.is_empty() && !second.is_empty());
        assert!(first.iter().all(|n| (1..=10).contains(n)));
        assert!(second.iter().all(|n| (11..=20).contains(n)));
        // Keyframes respect the detector cooldown.
        for pair in first.windows(2) {
            assert!(pair[1] - pair[0] >= 2);
        }
        assert!(h.db.list(1, 1).unwrap().is_empty());
    }
}
