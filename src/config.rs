use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub staging: StagingConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    /// Per-session chunk directories live here.
    pub root: PathBuf,
    /// Assembled artifacts live here, one directory per session.
    pub artifact_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    pub strict_size: bool,
    #[serde(default = "default_chunk_endpoint")]
    pub chunk_endpoint: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl_secs(),
            max_chunks: default_max_chunks(),
            max_chunk_size: default_max_chunk_size(),
            max_file_size: default_max_file_size(),
            strict_size: false,
            chunk_endpoint: default_chunk_endpoint(),
        }
    }
}

impl UploadConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

fn default_session_ttl_secs() -> u64 {
    24 * 60 * 60
}
fn default_max_chunks() -> u32 {
    10_000
}
fn default_max_chunk_size() -> usize {
    64 * 1024 * 1024
}
fn default_max_file_size() -> u64 {
    5 * 1024 * 1024 * 1024
}
fn default_chunk_endpoint() -> String {
    "/upload/chunk".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReaperConfig {
    /// Seconds between sweeps; 0 disables the background task.
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,
    /// Orphaned staging directories younger than this are left alone.
    #[serde(default = "default_reaper_grace")]
    pub grace_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reaper_interval(),
            grace_secs: default_reaper_grace(),
        }
    }
}

fn default_reaper_interval() -> u64 {
    3600
}
fn default_reaper_grace() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Upload lifecycle events on stderr: `human`, `json`, or `off`.
    #[serde(default = "default_events")]
    pub events: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            events: default_events(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_events() -> String {
    "human".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate upload limits
    if config.upload.session_ttl_secs == 0 {
        anyhow::bail!("upload.session_ttl_secs must be > 0");
    }
    if config.upload.max_chunks == 0 {
        anyhow::bail!("upload.max_chunks must be > 0");
    }
    if config.upload.max_chunk_size == 0 {
        anyhow::bail!("upload.max_chunk_size must be > 0");
    }
    validate_chunk_endpoint(&config.upload.chunk_endpoint)?;

    // The reaper treats every unknown directory under staging.root as an
    // orphan, so artifacts must live elsewhere.
    if config.staging.artifact_root.starts_with(&config.staging.root) {
        anyhow::bail!("staging.artifact_root must not be inside staging.root");
    }

    // Validate logging
    match config.logging.events.as_str() {
        "human" | "json" | "off" => {}
        other => anyhow::bail!(
            "Unknown logging.events mode: '{}'. Must be human, json, or off.",
            other
        ),
    }
    tracing_subscriber::EnvFilter::try_new(&config.logging.level)
        .with_context(|| format!("Invalid logging.level: '{}'", config.logging.level))?;

    Ok(())
}

/// Literal routes the server mounts next to the chunk endpoint.
const FIXED_ROUTES: &[&str] = &["/upload/init", "/health"];

fn validate_chunk_endpoint(endpoint: &str) -> Result<()> {
    if !endpoint.starts_with('/') {
        anyhow::bail!("upload.chunk_endpoint must start with '/'");
    }
    if endpoint.contains(['{', '}', '*']) {
        anyhow::bail!(
            "upload.chunk_endpoint must be a literal path, got '{}'",
            endpoint
        );
    }
    if FIXED_ROUTES.contains(&endpoint) {
        anyhow::bail!(
            "upload.chunk_endpoint '{}' collides with a built-in route",
            endpoint
        );
    }
    Ok(())
}
