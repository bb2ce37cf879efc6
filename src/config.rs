use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_catalog_path")]
    pub catalog_path: String,
    #[serde(default = "default_catalog_refresh_hours")]
    pub catalog_refresh_hours: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            catalog_path: default_catalog_path(),
            catalog_refresh_hours: default_catalog_refresh_hours(),
        }
    }
}

impl ArchiveConfig {
    /// Absolute URL for a path published on the archive host.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.host.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn catalog_url(&self) -> String {
        self.url_for(&self.catalog_path)
    }
}

fn default_host() -> String {
    "https://data.commoncrawl.org".to_string()
}
fn default_catalog_path() -> String {
    "/cc-index/collections/index.html".to_string()
}
fn default_catalog_refresh_hours() -> u64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    #[serde(default = "default_domains")]
    pub domains: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    #[serde(default = "default_retry_file")]
    pub retry_file: PathBuf,
    #[serde(default = "default_collection_dir")]
    pub collection_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            domains: default_domains(),
            cache_dir: default_cache_dir(),
            history_dir: default_history_dir(),
            retry_file: default_retry_file(),
            collection_dir: default_collection_dir(),
        }
    }
}

impl PathsConfig {
    pub fn catalog_file(&self) -> PathBuf {
        self.cache_dir.join("archives.json")
    }
}

fn default_domains() -> PathBuf {
    PathBuf::from("domains.conf")
}
fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache")
}
fn default_history_dir() -> PathBuf {
    PathBuf::from("history")
}
fn default_retry_file() -> PathBuf {
    PathBuf::from("retryqueue")
}
fn default_collection_dir() -> PathBuf {
    PathBuf::from("collection")
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_min_interval_ms() -> u64 {
    1000
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_max_secs() -> u64 {
    300
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_user_agent() -> String {
    format!("crawl-collector/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_cache_shard_blocks")]
    pub cache_shard_blocks: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            cache_shard_blocks: default_cache_shard_blocks(),
        }
    }
}

fn default_cache_shard_blocks() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Pause between cycles when there is nothing left to do.
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            idle_secs: default_idle_secs(),
        }
    }
}

fn default_idle_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_notify")]
    pub notify: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            notify: default_notify(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_notify() -> String {
    "auto".to_string()
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        self.level
            .parse::<tracing::Level>()
            .map_err(|_| anyhow::anyhow!("Unknown logging.level: '{}'", self.level))
    }
}

/// Parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let host = &config.archive.host;
    if !(host.starts_with("http://") || host.starts_with("https://")) {
        bail!("archive.host must be an http(s) URL, got '{}'", host);
    }

    if config.fetch.backoff_base_ms == 0 {
        bail!("fetch.backoff_base_ms must be > 0");
    }
    if config.fetch.backoff_max_secs.saturating_mul(1000) < config.fetch.backoff_base_ms {
        bail!("fetch.backoff_max_secs must not be below fetch.backoff_base_ms");
    }
    if config.fetch.timeout_secs == 0 {
        bail!("fetch.timeout_secs must be > 0");
    }
    if config.archive.catalog_refresh_hours == 0 {
        bail!("archive.catalog_refresh_hours must be > 0");
    }

    config.logging.tracing_level()?;
    match config.logging.notify.as_str() {
        "auto" | "human" | "json" | "off" => {}
        other => bail!(
            "Unknown logging.notify: '{}'. Must be auto, human, json, or off.",
            other
        ),
    }

    Ok(())
}

/// Read the configured domain list: one domain per line, `#` comments and
/// blank lines ignored, duplicates dropped with a warning.
pub fn load_domains(path: &Path) -> Result<Vec<crate::domain::DomainKey>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read domain list: {}", path.display()))?;

    let mut domains: Vec<crate::domain::DomainKey> = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let key = crate::domain::DomainKey::new(line)
            .with_context(|| format!("{}:{}", path.display(), lineno + 1))?;
        if domains.contains(&key) {
            tracing::warn!(domain = %key, "duplicate domain in domain list, ignoring");
            continue;
        }
        domains.push(key);
    }
    Ok(domains)
}
