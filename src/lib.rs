//! Watchdog: live camera change detection, vision-model captioning,
//! per-camera analytics and alerts, and grounded chat over what was seen.

pub mod alerts;
pub mod analytics;
pub mod caption;
pub mod capture;
pub mod change_detector;
pub mod chat;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod embedding;
pub mod error;
pub mod frame;
pub mod llm;
pub mod logging;
pub mod notify;
pub mod stream;
pub mod types;

#[cfg(test)]
mod test_support;
