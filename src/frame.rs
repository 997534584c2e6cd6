//! Frames and the pull-based video source contract.

use std::sync::Arc;

use anyhow::Result;
use image::RgbImage;

/// One decoded RGB frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }
}

/// A live or file-backed stream of decoded frames.
///
/// The ingestion loop is the sole owner of a source and calls
/// [`VideoSource::release`] exactly once on its exit path.
pub trait VideoSource: Send {
    /// Next frame, or `Ok(None)` when the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Free the underlying handle (process, file list, device).
    fn release(&mut self);

    fn describe(&self) -> String;

    /// Handle that makes a blocked [`VideoSource::next_frame`] return.
    /// Sources whose reads cannot stall return `None`.
    fn interrupter(&self) -> Option<Interrupter> {
        None
    }
}

/// Unblocks a pending frame read from another thread.
#[derive(Clone)]
pub struct Interrupter(Arc<dyn Fn() + Send + Sync>);

impl Interrupter {
    pub fn new(f: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn interrupt(&self) {
        (self.0)()
    }
}

/// Opens a [`VideoSource`] for a source URL or path.
pub trait SourceOpener: Send + Sync {
    fn open(&self, source_url: &str) -> Result<Box<dyn VideoSource>>;
}
