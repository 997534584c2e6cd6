/// Captioning dispatch: ingestion thread → caption worker
///
/// Architecture:
///   ingestion loop (blocking thread)
///     → JPEG/base64 encode under the payload budget
///     → [flume channel, try_send] → caption worker thread
///       (current-thread tokio runtime, one task per keyframe)
///         → vision model → parse → observation store
///           → analytics aggregator → alert engine
///
/// The ingestion side never waits: a full queue drops the keyframe.
/// Every completion runs as an isolated unit whose failures are logged.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use flume::TrySendError;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertEngine;
use crate::analytics::Aggregator;
use crate::caption::{encode_for_caption, parse_caption};
use crate::config::CaptioningConfig;
use crate::db::ObservationStore;
use crate::frame::Frame;
use crate::llm::Captioner;
use crate::types::Observation;

/// One keyframe waiting for a caption.
#[derive(Debug, Clone)]
pub struct CaptionJob {
    pub camera_id: i64,
    pub frame_number: u64,
    pub image_b64: String,
}

// ─── Submission side ────────────────────────────────────────────────────────

/// Cheap, cloneable handle used by the ingestion loop.
#[derive(Clone)]
pub struct CaptionDispatcher {
    tx: flume::Sender<CaptionJob>,
    jpeg_quality: u8,
    max_payload_chars: usize,
}

impl CaptionDispatcher {
    pub(crate) fn new(tx: flume::Sender<CaptionJob>, cfg: &CaptioningConfig) -> Self {
        Self {
            tx,
            jpeg_quality: cfg.jpeg_quality,
            max_payload_chars: cfg.max_payload_chars,
        }
    }

    /// Encode and enqueue a keyframe without blocking. Returns whether the
    /// job was accepted.
    pub fn dispatch(&self, frame: &Frame, frame_number: u64, camera_id: i64) -> bool {
        let image_b64 =
            match encode_for_caption(&frame.image, self.jpeg_quality, self.max_payload_chars) {
                Ok(b64) => b64,
                Err(e) => {
                    warn!("Frame {} not dispatched: {}", frame_number, e);
                    return false;
                }
            };

        match self.tx.try_send(CaptionJob {
            camera_id,
            frame_number,
            image_b64,
        }) {
            Ok(()) => {
                debug!("Keyframe {} queued for captioning", frame_number);
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("Caption queue full, dropping keyframe {}", frame_number);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                warn!("Caption worker stopped, dropping keyframe {}", frame_number);
                false
            }
        }
    }
}

// ─── Completion side ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Stored { alerts: usize },
    CaptionFailed,
    Discarded,
    PersistFailed,
}

/// Caption → parse → append → aggregate → alert, for one job.
pub struct CompletionHandler {
    captioner: Arc<dyn Captioner>,
    store: Arc<dyn ObservationStore>,
    aggregator: Aggregator,
    alerts: AlertEngine,
}

impl CompletionHandler {
    pub fn new(
        captioner: Arc<dyn Captioner>,
        store: Arc<dyn ObservationStore>,
        aggregator: Aggregator,
        alerts: AlertEngine,
    ) -> Self {
        Self {
            captioner,
            store,
            aggregator,
            alerts,
        }
    }

    /// Never fails: every error is logged and reported as an outcome.
    pub async fn handle(&self, job: CaptionJob) -> JobOutcome {
        let raw = match self.captioner.caption(&job.image_b64).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(
                    "Captioning failed for camera {} frame {}: {}",
                    job.camera_id, job.frame_number, e
                );
                return JobOutcome::CaptionFailed;
            }
        };

        let observation = match parse_caption(&raw, job.camera_id, job.frame_number) {
            Ok(obs) => obs,
            Err(e) => {
                warn!(
                    "Discarding caption for camera {} frame {}: {}",
                    job.camera_id, job.frame_number, e
                );
                return JobOutcome::Discarded;
            }
        };

        match self.persist(&observation) {
            Ok(alerts) => {
                info!(
                    "Observation stored: camera {} frame {} ({} individuals, {} alerts)",
                    job.camera_id, job.frame_number, observation.individual_count, alerts
                );
                JobOutcome::Stored { alerts }
            }
            Err(e) => {
                error!(
                    "Persisting camera {} frame {} failed: {:#}",
                    job.camera_id, job.frame_number, e
                );
                JobOutcome::PersistFailed
            }
        }
    }

    fn persist(&self, obs: &Observation) -> Result<usize> {
        self.store.append(obs).context("append observation")?;
        self.aggregator
            .update(obs.camera_id, obs)
            .context("update analytics")?;
        let alerts = self
            .alerts
            .evaluate(obs.camera_id, obs.frame_number, obs)
            .context("evaluate alerts")?;
        Ok(alerts.len())
    }
}

// ─── Worker ─────────────────────────────────────────────────────────────────

/// Owns the caption event-loop thread.
pub struct CaptionWorker {
    stop_tx: watch::Sender<bool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptionWorker {
    /// Start the worker thread and return the submission handle with it.
    pub fn spawn(
        handler: Arc<CompletionHandler>,
        cfg: &CaptioningConfig,
    ) -> Result<(CaptionDispatcher, CaptionWorker)> {
        let (tx, rx) = flume::bounded::<CaptionJob>(cfg.queue_capacity.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name("caption-worker".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Caption worker runtime failed to start: {}", e);
                        return;
                    }
                };
                rt.block_on(run_worker(handler, rx, stop_rx));
            })
            .context("failed to spawn caption worker thread")?;

        info!("Caption worker started (queue capacity {})", cfg.queue_capacity);
        Ok((
            CaptionDispatcher::new(tx, cfg),
            CaptionWorker {
                stop_tx,
                thread: Some(thread),
            },
        ))
    }

    /// Stop accepting jobs, finish everything queued or in flight, join.
    pub fn shutdown(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Caption worker thread panicked");
            }
        }
        info!("Caption worker stopped");
    }
}

async fn run_worker(
    handler: Arc<CompletionHandler>,
    rx: flume::Receiver<CaptionJob>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut inflight = JoinSet::new();

    loop {
        tokio::select! {
            job = rx.recv_async() => match job {
                Ok(job) => {
                    let handler = Arc::clone(&handler);
                    inflight.spawn(async move { handler.handle(job).await });
                }
                Err(_) => break,
            },
            _ = stop_rx.changed() => break,
            Some(done) = inflight.join_next(), if !inflight.is_empty() => {
                if let Err(e) = done {
                    error!("Caption task aborted: {}", e);
                }
            }
        }
    }

    // Close the queue, then run whatever was already accepted.
    let queued: Vec<CaptionJob> = rx.drain().collect();
    drop(rx);
    if !queued.is_empty() || !inflight.is_empty() {
        info!(
            "Caption worker draining {} queued and {} in-flight job(s)",
            queued.len(),
            inflight.len()
        );
    }
    for job in queued {
        let handler = Arc::clone(&handler);
        inflight.spawn(async move { handler.handle(job).await });
    }
    while let Some(done) = inflight.join_next().await {
        if let Err(e) = done {
            error!("Caption task aborted: {}", e);
        }
    }
}
