//! Environment-driven configuration.
//!
//! Every knob lives under the `GLINT_` prefix and is read once at startup
//! into a plain [`Config`] value; nothing re-reads the environment per job.

use std::path::PathBuf;

use crate::types::{CaptionLength, NameMode, ProviderKind, TagsMode};

/// Worker configuration with defaults suitable for a local station setup.
#[derive(Debug, Clone)]
pub struct Config {
    /// VLM adapter to construct (`GLINT_PROVIDER`)
    pub provider: ProviderKind,
    /// Station base URL, with or without a `/v1` suffix (`GLINT_ENDPOINT`)
    pub endpoint: String,
    /// Remote endpoint URL, required when `provider = remote`
    pub remote_url: Option<String>,
    /// Bearer token for the remote endpoint
    pub remote_token: Option<String>,
    /// SQLite database shared with the upload pipeline (`GLINT_DB_PATH`)
    pub db_path: PathBuf,
    /// Idle sleep between polls when the queue is empty
    pub poll_seconds: f64,
    /// Sleep after a transient provider failure
    pub retry_backoff_seconds: f64,
    /// Downscale target for the longest image side; 0 disables scaling
    pub max_image_side: u32,
    /// JPEG re-encode quality
    pub jpeg_quality: u8,
    /// Send raw file bytes instead of the downscaled JPEG
    pub raw_image_bytes: bool,
    /// Caption verbosity requested from the VLM
    pub caption_length: CaptionLength,
    /// Maximum number of detect-confirmed tags to keep per asset
    pub max_tags: usize,
    /// Tag candidate source strategy
    pub tags_mode: TagsMode,
    /// Sentence-embedding model identifier (`GLINT_EMBEDDING_MODEL`)
    pub embedding_model: String,
    /// Directory holding embedder model files (`GLINT_MODEL_DIR`)
    pub model_dir: PathBuf,
    /// Generate display names from captions/titles
    pub generate_names: bool,
    /// Maintain the `named/` symlink alias alongside the display name
    pub create_named_alias: bool,
    /// Title source for generated names
    pub name_mode: NameMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::LocalStation,
            endpoint: "http://127.0.0.1:2020".to_string(),
            remote_url: None,
            remote_token: None,
            db_path: PathBuf::from("data/glint.sqlite3"),
            poll_seconds: 1.0,
            retry_backoff_seconds: 5.0,
            max_image_side: 512,
            jpeg_quality: 85,
            raw_image_bytes: false,
            caption_length: CaptionLength::Normal,
            max_tags: 8,
            tags_mode: TagsMode::Hybrid,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            model_dir: default_model_dir(),
            generate_names: true,
            create_named_alias: true,
            name_mode: NameMode::Caption,
        }
    }
}

impl Config {
    /// Build a configuration from `GLINT_*` environment variables,
    /// falling back to defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(value) = env_str("GLINT_PROVIDER") {
            match ProviderKind::parse(&value) {
                Some(kind) => cfg.provider = kind,
                None => tracing::warn!(%value, "unknown GLINT_PROVIDER, using local_station"),
            }
        }
        if let Some(value) = env_str("GLINT_ENDPOINT") {
            cfg.endpoint = value;
        }
        cfg.remote_url = env_str("GLINT_REMOTE_URL");
        cfg.remote_token = env_str("GLINT_REMOTE_TOKEN");
        if let Some(value) = env_str("GLINT_DB_PATH") {
            cfg.db_path = PathBuf::from(shellexpand::tilde(&value).into_owned());
        }
        cfg.poll_seconds = env_parse("GLINT_POLL_SECONDS", cfg.poll_seconds);
        cfg.retry_backoff_seconds =
            env_parse("GLINT_RETRY_BACKOFF_SECONDS", cfg.retry_backoff_seconds);
        cfg.max_image_side = env_parse("GLINT_MAX_IMAGE_SIDE", cfg.max_image_side);
        cfg.jpeg_quality = env_parse("GLINT_JPEG_QUALITY", cfg.jpeg_quality);
        cfg.raw_image_bytes = env_flag("GLINT_RAW_IMAGE_BYTES", cfg.raw_image_bytes);
        if let Some(value) = env_str("GLINT_CAPTION_LENGTH") {
            match CaptionLength::parse(&value) {
                Some(length) => cfg.caption_length = length,
                None => tracing::warn!(%value, "unknown GLINT_CAPTION_LENGTH, using normal"),
            }
        }
        cfg.max_tags = env_parse("GLINT_SEGMENT_TOP_N", cfg.max_tags);
        if let Some(value) = env_str("GLINT_TAGS_MODE") {
            match TagsMode::parse(&value) {
                Some(mode) => cfg.tags_mode = mode,
                None => tracing::warn!(%value, "unknown GLINT_TAGS_MODE, using hybrid"),
            }
        }
        if let Some(value) = env_str("GLINT_EMBEDDING_MODEL") {
            cfg.embedding_model = value;
        }
        if let Some(value) = env_str("GLINT_MODEL_DIR") {
            cfg.model_dir = PathBuf::from(shellexpand::tilde(&value).into_owned());
        }
        cfg.generate_names = env_flag("GLINT_GENERATE_NAMES", cfg.generate_names);
        cfg.create_named_alias = env_flag("GLINT_CREATE_NAMED_ALIAS", cfg.create_named_alias);
        if let Some(value) = env_str("GLINT_NAME_MODE") {
            match NameMode::parse(&value) {
                Some(mode) => cfg.name_mode = mode,
                None => tracing::warn!(%value, "unknown GLINT_NAME_MODE, using caption"),
            }
        }

        cfg
    }
}

/// Default embedder model directory, platform-appropriate with a home-dir
/// fallback.
fn default_model_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "glint", "glint")
        .map(|dirs| dirs.data_dir().join("models"))
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".glint").join("models")
        })
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env_str(key) {
        Some(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!(key, %value, "unparseable value, using default");
                default
            }
        },
        None => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_str(key) {
        Some(value) => parse_flag(&value).unwrap_or_else(|| {
            tracing::warn!(key, %value, "unparseable flag, using default");
            default
        }),
        None => default,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
