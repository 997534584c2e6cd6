use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::frame::{Frame, Interrupter, SourceOpener, VideoSource};

// ─── ffmpeg-decoded stream ──────────────────────────────────────────────────

/// Any URL or file ffmpeg can read, decoded to raw RGB24 at a fixed size.
pub struct FfmpegSource {
    url: String,
    /// Shared with the interrupter: killing ffmpeg ends a stalled read with EOF.
    child: Arc<Mutex<Option<Child>>>,
    stdout: Option<ChildStdout>,
    width: u32,
    height: u32,
    buffer: Vec<u8>,
}

impl FfmpegSource {
    pub fn open(url: &str, width: u32, height: u32) -> Result<Self> {
        info!("Opening video source {} ({}x{})", url, width, height);

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner").arg("-loglevel").arg("error");

        if url.starts_with("rtsp://") {
            cmd.arg("-rtsp_transport").arg("tcp");
        }

        cmd.arg("-i")
            .arg(url)
            .arg("-an")
            .arg("-vf")
            .arg(format!("scale={}:{}", width, height))
            .arg("-pix_fmt")
            .arg("rgb24")
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn ffmpeg for {}", url))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;

        Ok(Self {
            url: url.to_string(),
            child: Arc::new(Mutex::new(Some(child))),
            stdout: Some(stdout),
            width,
            height,
            buffer: vec![0u8; (width as usize) * (height as usize) * 3],
        })
    }
}

impl VideoSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(None);
        };

        match stdout.read_exact(&mut self.buffer) {
            Ok(()) => {
                let image = RgbImage::from_raw(self.width, self.height, self.buffer.clone())
                    .ok_or_else(|| anyhow!("decoded frame has unexpected size"))?;
                Ok(Some(Frame::new(image)))
            }
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                debug!("ffmpeg stream {} reached end of input", self.url);
                Ok(None)
            }
            Err(err) => Err(err).with_context(|| format!("reading frames from {}", self.url)),
        }
    }

    fn release(&mut self) {
        self.stdout = None;
        let child = match self.child.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut child) = child {
            if let Err(e) = child.kill() {
                debug!("ffmpeg for {} already exited: {}", self.url, e);
            }
            if let Err(e) = child.wait() {
                warn!("Failed to reap ffmpeg for {}: {}", self.url, e);
            }
            info!("Released video source {}", self.url);
        }
    }

    fn describe(&self) -> String {
        format!("ffmpeg:{}", self.url)
    }

    fn interrupter(&self) -> Option<Interrupter> {
        let child = Arc::clone(&self.child);
        let url = self.url.clone();
        Some(Interrupter::new(move || {
            if let Ok(mut slot) = child.lock() {
                if let Some(child) = slot.as_mut() {
                    debug!("Interrupting ffmpeg for {}", url);
                    let _ = child.kill();
                }
            }
        }))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.release();
    }
}

// ─── Directory of still images ──────────────────────────────────────────────

/// File-backed source: every JPEG/PNG in a directory, in lexical order.
pub struct ImageDirSource {
    dir: PathBuf,
    files: std::vec::IntoIter<PathBuf>,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("cannot list {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_image_file(p))
            .collect();
        files.sort();

        info!("Opened image directory {} ({} frames)", dir.display(), files.len());
        Ok(Self {
            dir: dir.to_path_buf(),
            files: files.into_iter(),
        })
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

impl VideoSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.files.next() else {
            return Ok(None);
        };
        let image = image::open(&path)
            .with_context(|| format!("cannot decode {}", path.display()))?
            .to_rgb8();
        Ok(Some(Frame::new(image)))
    }

    fn release(&mut self) {
        self.files = Vec::new().into_iter();
    }

    fn describe(&self) -> String {
        format!("images:{}", self.dir.display())
    }
}

// ─── Opener ─────────────────────────────────────────────────────────────────

/// Existing directories are read as image sequences, everything else
/// goes through ffmpeg.
pub struct DefaultSourceOpener {
    width: u32,
    height: u32,
}

impl DefaultSourceOpener {
    pub fn new(cfg: &StreamConfig) -> Self {
        Self {
            width: cfg.frame_width,
            height: cfg.frame_height,
        }
    }
}

impl SourceOpener for DefaultSourceOpener {
    fn open(&self, source_url: &str) -> Result<Box<dyn VideoSource>> {
        let path = Path::new(source_url);
        if path.is_dir() {
            return Ok(Box::new(ImageDirSource::open(path)?));
        }
        Ok(Box::new(FfmpegSource::open(source_url, self.width, self.height)?))
    }
}
