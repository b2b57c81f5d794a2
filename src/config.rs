use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::stream::StartingPosition;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub streams: StreamsConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub indexing: IndexingConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    pub bucket: String,
    /// Root directory for the `filesystem` backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_object_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_backend() -> String {
    "filesystem".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_object_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_raw_prefix")]
    pub prefix: String,
    #[serde(default = "default_suffixes")]
    pub suffixes: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Enqueue objects already present under the prefix at startup.
    #[serde(default)]
    pub scan_on_start: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            prefix: default_raw_prefix(),
            suffixes: default_suffixes(),
            exclude_globs: Vec::new(),
            scan_on_start: false,
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl WatcherConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(10),
        )
    }
}

fn default_raw_prefix() -> String {
    "bizcard-raw-img/".to_string()
}
fn default_suffixes() -> Vec<String> {
    vec![".jpg".to_string()]
}
fn default_max_retries() -> u32 {
    5
}
fn default_backoff_base_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamsConfig {
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
    #[serde(default = "default_image_stream")]
    pub image_stream: String,
    #[serde(default = "default_text_stream")]
    pub text_stream: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            partitions: default_partitions(),
            retention_hours: default_retention_hours(),
            image_stream: default_image_stream(),
            text_stream: default_text_stream(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl StreamsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_partitions() -> u32 {
    4
}
fn default_retention_hours() -> u64 {
    24
}
fn default_image_stream() -> String {
    "bizcard-image".to_string()
}
fn default_text_stream() -> String {
    "bizcard-text".to_string()
}
fn default_poll_interval_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub starting_position: StartingPosition,
    /// Wall-clock budget for one batch.
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    /// Timeout for each external call (fetch, OCR, store, append).
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_worker_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_extraction_batch_size(),
            starting_position: StartingPosition::default(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_worker_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl ExtractionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(30),
        )
        .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
    }

    pub fn invocation_budget(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

fn default_extraction_batch_size() -> usize {
    100
}
fn default_invocation_timeout_secs() -> u64 {
    300
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_worker_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexingConfig {
    #[serde(default = "default_indexing_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub starting_position: StartingPosition,
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_worker_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_indexing_batch_size(),
            starting_position: StartingPosition::default(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_worker_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl IndexingConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(30),
        )
        .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
    }

    pub fn invocation_budget(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}

fn default_indexing_batch_size() -> usize {
    99
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_archive_prefix")]
    pub prefix: String,
    #[serde(default = "default_archive_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_archive_size_bytes")]
    pub size_bytes: usize,
    #[serde(default)]
    pub starting_position: StartingPosition,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_archive_prefix(),
            interval_secs: default_archive_interval_secs(),
            size_bytes: default_archive_size_bytes(),
            starting_position: StartingPosition::default(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl ArchiveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(60),
        )
    }
}

fn default_true() -> bool {
    true
}
fn default_archive_prefix() -> String {
    "bizcard-text/".to_string()
}
fn default_archive_interval_secs() -> u64 {
    60
}
fn default_archive_size_bytes() -> usize {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    /// Upper bound on the total size of cached results.
    #[serde(default = "default_cache_max_bytes")]
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl_secs(),
            max_bytes: default_cache_max_bytes(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_cache_max_bytes() -> u64 {
    64 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_ocr_provider(),
            endpoint: None,
            timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl OcrConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(default_backoff_base_ms()),
            Duration::from_secs(30),
        )
        .with_call_timeout(Duration::from_secs(self.timeout_secs))
    }
}

fn default_ocr_provider() -> String {
    "disabled".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default = "default_max_clock_skew_secs")]
    pub max_clock_skew_secs: i64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

fn default_max_clock_skew_secs() -> i64 {
    300
}
fn default_max_upload_bytes() -> usize {
    10 * 1024 * 1024
}

/// An access key accepted by the upload API.
///
/// The secret is either inline (`secret`) or read from an environment
/// variable (`secret_env`).
#[derive(Debug, Deserialize, Clone)]
pub struct CredentialConfig {
    pub key_id: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub secret_env: Option<String>,
}

impl CredentialConfig {
    pub fn resolve_secret(&self) -> Result<String> {
        if let Some(ref secret) = self.secret {
            return Ok(secret.clone());
        }
        match self.secret_env {
            Some(ref var) => std::env::var(var).with_context(|| {
                format!(
                    "credential '{}': environment variable {} not set",
                    self.key_id, var
                )
            }),
            None => bail!(
                "credential '{}' needs either secret or secret_env",
                self.key_id
            ),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    match config.object_store.backend.as_str() {
        "filesystem" => {
            if config.object_store.root.is_none() {
                bail!("object_store.root is required for the filesystem backend");
            }
        }
        "s3" => {}
        other => bail!(
            "Unknown object_store.backend: '{}'. Must be filesystem or s3.",
            other
        ),
    }
    if config.object_store.bucket.is_empty() {
        bail!("object_store.bucket must not be empty");
    }

    if config.streams.partitions == 0 {
        bail!("streams.partitions must be > 0");
    }
    if config.streams.image_stream == config.streams.text_stream {
        bail!("streams.image_stream and streams.text_stream must differ");
    }

    if config.extraction.batch_size == 0 || config.indexing.batch_size == 0 {
        bail!("worker batch_size must be > 0");
    }

    if config.watcher.suffixes.is_empty() {
        bail!("watcher.suffixes must contain at least one suffix");
    }
    if config.archive.enabled && config.archive.prefix.starts_with(&config.watcher.prefix) {
        bail!("archive.prefix must not live under watcher.prefix");
    }
    if config.archive.size_bytes == 0 || config.archive.interval_secs == 0 {
        bail!("archive.size_bytes and archive.interval_secs must be > 0");
    }

    if config.cache.ttl_secs == 0 {
        bail!("cache.ttl_secs must be > 0");
    }

    match config.ocr.provider.as_str() {
        "disabled" => {}
        "http" => {
            if config.ocr.endpoint.is_none() {
                bail!("ocr.endpoint must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown ocr provider: '{}'. Must be disabled or http.",
            other
        ),
    }

    for cred in &config.server.credentials {
        if cred.key_id.is_empty() {
            bail!("server.credentials entries need a key_id");
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[db]
path = "/tmp/bizcard.sqlite"

[object_store]
bucket = "cards"
root = "/tmp/objects"

[server]
bind = "127.0.0.1:8040"
"#;

    #[test]
    fn minimal_config_uses_pipeline_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.extraction.batch_size, 100);
        assert_eq!(config.indexing.batch_size, 99);
        assert_eq!(config.extraction.starting_position, StartingPosition::Latest);
        assert_eq!(config.watcher.prefix, "bizcard-raw-img/");
        assert_eq!(config.watcher.suffixes, vec![".jpg".to_string()]);
        assert_eq!(config.archive.interval_secs, 60);
        assert_eq!(config.archive.size_bytes, 1024 * 1024);
        assert_eq!(config.archive.prefix, "bizcard-text/");
        assert_eq!(config.extraction.invocation_timeout_secs, 300);
        assert!(!config.ocr.is_enabled());
    }

    #[test]
    fn rejects_http_ocr_without_endpoint() {
        let content = format!("{}\n[ocr]\nprovider = \"http\"\n", MINIMAL);
        let err = parse_config(&content).unwrap_err();
        assert!(err.to_string().contains("ocr.endpoint"));
    }

    #[test]
    fn rejects_archive_prefix_under_watched_prefix() {
        let content = format!(
            "{}\n[archive]\nprefix = \"bizcard-raw-img/archive/\"\n",
            MINIMAL
        );
        assert!(parse_config(&content).is_err());
    }

    #[test]
    fn accepts_trim_horizon_start() {
        let content = format!(
            "{}\n[indexing]\nstarting_position = \"trim_horizon\"\n",
            MINIMAL
        );
        let config = parse_config(&content).unwrap();
        assert_eq!(
            config.indexing.starting_position,
            StartingPosition::TrimHorizon
        );
        assert_eq!(config.indexing.batch_size, 99);
    }
}
