//! Alert notification delivery.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::NotifyConfig;
use crate::types::Camera;

/// Delivers a summary of one observation's alerts. Fire-and-forget: an
/// `Err` only reports that delivery could not be started.
pub trait Notifier: Send + Sync {
    fn notify(&self, camera: &Camera, descriptions: &[String]) -> Result<()>;

    /// Block until every delivery started so far has finished.
    fn flush(&self) {}
}

/// Build the notifier selected by config.
pub fn from_config(cfg: &NotifyConfig) -> Box<dyn Notifier> {
    if cfg.enabled {
        Box::new(MailNotifier::new(cfg))
    } else {
        Box::new(LogNotifier)
    }
}

/// Only logs the alert summary.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, camera: &Camera, descriptions: &[String]) -> Result<()> {
        info!(
            "Alert summary for camera {} ({}): {}",
            camera.id,
            camera.name,
            descriptions.join(" | ")
        );
        Ok(())
    }
}

/// Pipes a MIME message into a local mail command (`sendmail -t` style).
pub struct MailNotifier {
    program: String,
    args: Vec<String>,
    from_address: String,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl MailNotifier {
    pub fn new(cfg: &NotifyConfig) -> Self {
        let mut parts = cfg.mail_command.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| "sendmail".to_string());
        Self {
            program,
            args: parts.collect(),
            from_address: cfg.from_address.clone(),
            pending: Mutex::new(Vec::new()),
        }
    }

    fn take_pending(&self) -> Vec<JoinHandle<()>> {
        match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl Notifier for MailNotifier {
    fn notify(&self, camera: &Camera, descriptions: &[String]) -> Result<()> {
        if camera.email.trim().is_empty() {
            return Err(anyhow!("camera {} has no notification address", camera.id));
        }

        let message = compose_message(&self.from_address, camera, descriptions);
        let program = self.program.clone();
        let args = self.args.clone();
        let recipient = camera.email.clone();

        let handle = std::thread::Builder::new()
            .name("watchdog-mail".into())
            .spawn(move || match send_with(&program, &args, &message) {
                Ok(()) => info!("Alert email sent to {}", recipient),
                Err(e) => error!("Alert email to {} failed: {:#}", recipient, e),
            })
            .context("failed to spawn mail thread")?;

        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
        }
        Ok(())
    }

    fn flush(&self) {
        let pending = self.take_pending();
        if !pending.is_empty() {
            info!("Waiting for {} alert email(s) to finish", pending.len());
        }
        for handle in pending {
            if handle.join().is_err() {
                error!("Mail thread panicked");
            }
        }
    }
}

fn send_with(program: &str, args: &[String], message: &str) -> Result<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("cannot run {}", program))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(message.as_bytes())
            .context("cannot write message to mail command")?;
    }

    let output = child.wait_with_output()?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        warn!("{} exited with {}", program, output.status);
        Err(anyhow!("mail command failed: {}", stderr.trim()))
    }
}

/// Plain-text + HTML alternative message for one observation's alerts.
pub fn compose_message(from: &str, camera: &Camera, descriptions: &[String]) -> String {
    let boundary = format!("watchdog-boundary-{}", Uuid::new_v4().simple());
    let mut msg = String::new();

    msg.push_str(&format!("From: {}\r\n", from));
    msg.push_str(&format!("To: {}\r\n", camera.email));
    msg.push_str(&format!("Subject: Watchdog alert: {}\r\n", camera.name));
    msg.push_str(&format!("Date: {}\r\n", chrono::Utc::now().to_rfc2822()));
    msg.push_str("MIME-Version: 1.0\r\n");
    msg.push_str(&format!(
        "Content-Type: multipart/alternative; boundary=\"{}\"\r\n\r\n",
        boundary
    ));

    msg.push_str(&format!("--{}\r\n", boundary));
    msg.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    msg.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
    msg.push_str(&format!("Camera \"{}\" reported:\r\n\r\n", camera.name));
    for d in descriptions {
        msg.push_str(&format!("- {}\r\n", d));
    }
    msg.push_str("\r\n");

    msg.push_str(&format!("--{}\r\n", boundary));
    msg.push_str("Content-Type: text/html; charset=utf-8\r\n");
    msg.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
    msg.push_str(&format!(
        "<html><body><h2>Camera {}</h2><ul>",
        escape_html(&camera.name)
    ));
    for d in descriptions {
        msg.push_str(&format!("<li>{}</li>", escape_html(d)));
    }
    msg.push_str("</ul></body></html>\r\n");

    msg.push_str(&format!("--{}--\r\n", boundary));
    msg
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
