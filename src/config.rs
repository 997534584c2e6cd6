/// Watchdog configuration
///
/// Loaded from watchdog.toml (working directory) with env-var overrides.
/// Env format: WATCHDOG__SECTION__KEY (double underscore separators).

use std::collections::BTreeMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub captioning: CaptioningConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "watchdog.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_signature_width")]
    pub signature_width: u32,
    #[serde(default = "default_signature_height")]
    pub signature_height: u32,
    /// Per-cell luma difference that counts as "changed".
    #[serde(default = "default_pixel_delta")]
    pub pixel_delta: u8,
    /// Fraction of changed cells above which a frame is a keyframe.
    #[serde(default = "default_change_threshold")]
    pub change_threshold: f32,
    #[serde(default = "default_cooldown_frames")]
    pub cooldown_frames: u32,
}

fn default_signature_width() -> u32 {
    64
}
fn default_signature_height() -> u32 {
    36
}
fn default_pixel_delta() -> u8 {
    25
}
fn default_change_threshold() -> f32 {
    0.01
}
fn default_cooldown_frames() -> u32 {
    90
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            signature_width: default_signature_width(),
            signature_height: default_signature_height(),
            pixel_delta: default_pixel_delta(),
            change_threshold: default_change_threshold(),
            cooldown_frames: default_cooldown_frames(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptioningConfig {
    #[serde(default = "default_caption_url")]
    pub base_url: String,
    #[serde(default = "default_caption_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_max_payload_chars")]
    pub max_payload_chars: usize,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_caption_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_caption_temperature")]
    pub temperature: f32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_caption_url() -> String {
    "https://ai.api.nvidia.com/v1/gr/meta/llama-3.2-90b-vision-instruct".to_string()
}
fn default_caption_model() -> String {
    "meta/llama-3.2-90b-vision-instruct".to_string()
}
fn default_max_payload_chars() -> usize {
    180_000
}
fn default_jpeg_quality() -> u8 {
    50
}
fn default_caption_max_tokens() -> u32 {
    512
}
fn default_caption_temperature() -> f32 {
    0.4
}
fn default_queue_capacity() -> usize {
    32
}
fn default_timeout_secs() -> u64 {
    60
}

impl Default for CaptioningConfig {
    fn default() -> Self {
        Self {
            base_url: default_caption_url(),
            model: default_caption_model(),
            api_key: None,
            max_payload_chars: default_max_payload_chars(),
            jpeg_quality: default_jpeg_quality(),
            max_tokens: default_caption_max_tokens(),
            temperature: default_caption_temperature(),
            queue_capacity: default_queue_capacity(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_url")]
    pub base_url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_chat_url() -> String {
    "https://api.aimlapi.com/v1".to_string()
}
fn default_chat_model() -> String {
    "meta-llama/Llama-3.2-3B-Instruct-Turbo".to_string()
}
fn default_recent_limit() -> usize {
    100
}
fn default_top_k() -> usize {
    3
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_chat_url(),
            model: default_chat_model(),
            api_key: None,
            recent_limit: default_recent_limit(),
            top_k: default_top_k(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// OpenAI-compatible base URL; `None` selects the local hashing embedder.
    pub base_url: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub api_key: Option<String>,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

fn default_embedding_model() -> String {
    "sentence-transformers/all-MiniLM-L6-v2".to_string()
}
fn default_dimensions() -> usize {
    384
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            model: default_embedding_model(),
            api_key: None,
            dimensions: default_dimensions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_frame_width")]
    pub frame_width: u32,
    #[serde(default = "default_frame_height")]
    pub frame_height: u32,
}

fn default_frame_width() -> u32 {
    640
}
fn default_frame_height() -> u32 {
    360
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_width: default_frame_width(),
            frame_height: default_frame_height(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_notify_enabled")]
    pub enabled: bool,
    #[serde(default = "default_mail_command")]
    pub mail_command: String,
    #[serde(default = "default_from_address")]
    pub from_address: String,
}

fn default_notify_enabled() -> bool {
    true
}
fn default_mail_command() -> String {
    "sendmail -t".to_string()
}
fn default_from_address() -> String {
    "watchdog@localhost".to_string()
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: default_notify_enabled(),
            mail_command: default_mail_command(),
            from_address: default_from_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Base level when neither RUST_LOG nor WATCHDOG_LOG_LEVEL is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Per-module overrides, e.g. `stream = "debug"` → `watchdog::stream=debug`.
    #[serde(default)]
    pub components: BTreeMap<String, String>,
    /// Log directory; defaults to `<data_dir>/watchdog/logs`.
    pub dir: Option<String>,
    #[serde(default = "default_log_to_file")]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_to_file() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            components: BTreeMap::new(),
            dir: None,
            file: default_log_to_file(),
        }
    }
}

/// Load configuration from watchdog.toml + environment variable overrides.
///
/// Search order:
///   1. .env (loaded into the process environment, if present)
///   2. ./watchdog.toml (working directory)
///   3. Environment variables: WATCHDOG__CAPTIONING__MODEL, etc.
pub fn load_config() -> Result<AppConfig, config::ConfigError> {
    let _ = dotenvy::dotenv();

    let builder = config::Config::builder()
        .add_source(config::File::with_name("watchdog").required(false))
        .add_source(
            config::Environment::with_prefix("WATCHDOG")
                .separator("__")
                .try_parsing(true),
        );

    let settings = builder.build()?;
    let mut app = settings.try_deserialize::<AppConfig>()?;
    apply_key_fallbacks(&mut app, |name| std::env::var(name).ok());
    Ok(app)
}

/// Convenience: provider tokens under their conventional names
/// (without the WATCHDOG__ prefix).
fn apply_key_fallbacks(app: &mut AppConfig, env: impl Fn(&str) -> Option<String>) {
    if app.captioning.api_key.is_none() {
        app.captioning.api_key = env("NVIDIA_API_TOKEN");
    }
    if app.chat.api_key.is_none() {
        app.chat.api_key = env("AI_ML_API");
    }
    if app.embedding.api_key.is_none() {
        app.embedding.api_key = app.chat.api_key.clone();
    }
}
