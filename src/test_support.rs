//! Shared fakes for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::CaptionError;
use crate::llm::{Captioner, ChatModel};
use crate::notify::Notifier;
use crate::types::Camera;

/// Captioner that returns a fixed answer and counts calls.
pub struct FixedCaptioner {
    pub answer: Result<String, String>,
    pub calls: AtomicUsize,
}

impl FixedCaptioner {
    pub fn ok(answer: &str) -> Self {
        Self {
            answer: Ok(answer.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            answer: Err(reason.to_string()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Captioner for FixedCaptioner {
    async fn caption(&self, _image_b64: &str) -> Result<String, CaptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone().map_err(CaptionError::Transport)
    }
}

/// Chat model that echoes the prompt it was given.
#[derive(Default)]
pub struct EchoChat {
    pub prompts: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ChatModel for EchoChat {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        Ok(format!("answer to: {}", user.lines().next().unwrap_or_default()))
    }
}

/// Notifier that records every call.
#[derive(Default, Clone)]
pub struct RecordingNotifier {
    pub calls: Arc<Mutex<Vec<(i64, Vec<String>)>>>,
    pub fail: bool,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, camera: &Camera, descriptions: &[String]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((camera.id, descriptions.to_vec()));
        if self.fail {
            anyhow::bail!("mail relay down");
        }
        Ok(())
    }
}
