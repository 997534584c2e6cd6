use thiserror::Error;

/// Rejected stream-controller transitions. The controller state is left
/// untouched whenever one of these is returned.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream is already running for camera {camera_id} ({source_url})")]
    AlreadyRunning { camera_id: i64, source_url: String },
    #[error("no stream is running")]
    NotRunning,
    #[error("no camera is flagged for monitoring")]
    NoMonitoredCamera,
    #[error("more than one camera is flagged for monitoring: {0:?}")]
    MultipleMonitoredCameras(Vec<i64>),
    #[error("unknown camera {0}")]
    UnknownCamera(i64),
    #[error("failed to open video source {source_url:?}: {reason}")]
    SourceOpen { source_url: String, reason: String },
    #[error("camera registry unavailable: {0}")]
    Registry(String),
}

/// Failures of one captioning request. None of these are retried.
#[derive(Debug, Error)]
pub enum CaptionError {
    #[error("captioning request failed: {0}")]
    Transport(String),
    #[error("captioning endpoint returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("malformed captioning response: {0}")]
    Malformed(String),
    #[error("encoded frame is {chars} base64 chars, budget is {budget}")]
    PayloadTooLarge { chars: usize, budget: usize },
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

impl From<reqwest::Error> for CaptionError {
    fn from(err: reqwest::Error) -> Self {
        CaptionError::Transport(err.to_string())
    }
}
