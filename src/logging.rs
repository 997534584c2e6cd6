//! Process-wide `tracing` setup: stdout plus an optional daily-rotated file,
//! with per-component levels for the pipeline stages.

use std::path::PathBuf;
use std::sync::{Once, OnceLock};

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

static INIT_LOGGING: Once = Once::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// HTTP client internals are only interesting when explicitly asked for.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn"];

fn resolve_log_dir(cfg: &LoggingConfig) -> PathBuf {
    match cfg.dir.as_deref().filter(|d| !d.is_empty()) {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("watchdog")
            .join("logs"),
    }
}

fn build_file_appender(log_dir: PathBuf) -> Option<(RollingFileAppender, PathBuf)> {
    if let Err(err) = std::fs::create_dir_all(&log_dir) {
        eprintln!(
            "[watchdog][WARN] Failed to create log directory {}: {}",
            log_dir.display(),
            err
        );
        return None;
    }

    Some((
        RollingFileAppender::new(Rotation::DAILY, &log_dir, "watchdog.log"),
        log_dir,
    ))
}

/// Filter directives: base level, quiet HTTP internals, then one
/// `watchdog::<component>=<level>` per override.
fn filter_directives(base: &str, cfg: &LoggingConfig) -> String {
    let mut directives = vec![base.trim().to_string()];
    directives.extend(QUIET_DEPENDENCIES.iter().map(|d| d.to_string()));
    for (component, level) in &cfg.components {
        let target = if component.starts_with("watchdog") {
            component.clone()
        } else {
            format!("watchdog::{}", component)
        };
        directives.push(format!("{}={}", target, level.trim()));
    }
    directives.join(",")
}

fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let base = std::env::var("WATCHDOG_LOG_LEVEL").unwrap_or_else(|_| cfg.level.clone());
    EnvFilter::try_new(filter_directives(&base, cfg)).unwrap_or_else(|err| {
        eprintln!("[watchdog][WARN] Invalid log filter ({}), using info", err);
        EnvFilter::new("info")
    })
}

pub fn init_logging(cfg: &LoggingConfig) {
    INIT_LOGGING.call_once(|| {
        let appender = if cfg.file {
            build_file_appender(resolve_log_dir(cfg))
        } else {
            None
        };
        let (file_layer, log_dir) = match appender {
            Some((appender, dir)) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let layer = fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(non_blocking);
                LOG_GUARD.set(guard).ok();
                (Some(layer), Some(dir))
            }
            None => (None, None),
        };

        let stdout_layer = fmt::layer()
            .with_target(true)
            .with_ansi(true)
            .with_timer(UtcTime::rfc_3339());

        let registry = tracing_subscriber::registry()
            .with(build_filter(cfg))
            .with(stdout_layer);
        if let Some(file_layer) = file_layer {
            registry.with(file_layer).init();
        } else {
            registry.init();
        }

        match log_dir {
            Some(dir) => info!("Logging to stdout and {}", dir.display()),
            None if cfg.file => warn!("Log directory unavailable, logging to stdout only"),
            None => info!("Logging to stdout only"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_become_module_targets() {
        let mut cfg = LoggingConfig::default();
        cfg.components.insert("stream".into(), "debug".into());
        cfg.components.insert("watchdog::dispatcher".into(), "trace".into());

        let directives = filter_directives("info", &cfg);
        assert!(directives.starts_with("info,"));
        assert!(directives.contains("reqwest=warn"));
        assert!(directives.contains("watchdog::stream=debug"));
        assert!(directives.contains("watchdog::dispatcher=trace"));
        assert!(EnvFilter::try_new(&directives).is_ok());
    }

    #[test]
    fn explicit_dir_wins() {
        let cfg = LoggingConfig {
            dir: Some("/tmp/watchdog-logs".into()),
            ..LoggingConfig::default()
        };
        assert_eq!(resolve_log_dir(&cfg), PathBuf::from("/tmp/watchdog-logs"));
        assert!(resolve_log_dir(&LoggingConfig::default()).ends_with("watchdog/logs"));
    }
}
