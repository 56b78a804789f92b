//! Application configuration for tedsync.
//!
//! User config lives at `~/.tedsync/tedsync.toml`.
//! CLI flags (and their environment fallbacks) override config file values,
//! which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TedSyncError};
use crate::types::Credentials;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "tedsync.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".tedsync";

// ---------------------------------------------------------------------------
// Config structs (matching tedsync.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Search engine connection and index settings.
    #[serde(default)]
    pub search: SearchSection,

    /// Document loading settings.
    #[serde(default)]
    pub ingest: IngestSection,

    /// Calendar, package download and scheduling settings.
    #[serde(default)]
    pub download: DownloadSection,
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSection {
    /// Base URL of the search engine.
    #[serde(default = "default_search_url")]
    pub url: String,

    /// Destination index name.
    #[serde(default = "default_index")]
    pub index: String,

    /// Basic-auth user name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Name of the env var holding the password (never store the password itself).
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// Minimum `index.mapping.total_fields.limit` to provision.
    #[serde(default = "default_field_limit")]
    pub field_limit: u64,

    /// Per-request timeout for search engine calls.
    #[serde(default = "default_search_timeout")]
    pub timeout_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            url: default_search_url(),
            index: default_index(),
            username: None,
            password_env: default_password_env(),
            field_limit: default_field_limit(),
            timeout_secs: default_search_timeout(),
        }
    }
}

fn default_search_url() -> String {
    "http://localhost:9200".into()
}
fn default_index() -> String {
    "ted".into()
}
fn default_password_env() -> String {
    "OPENSEARCH_PASSWORD".into()
}
fn default_field_limit() -> u64 {
    30_000
}
fn default_search_timeout() -> u64 {
    60
}

/// `[ingest]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSection {
    /// Documents per bulk request.
    #[serde(default = "default_bulk_size")]
    pub bulk_size: usize,

    /// Concurrent normalization workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            bulk_size: default_bulk_size(),
            workers: default_workers(),
        }
    }
}

fn default_bulk_size() -> usize {
    100
}
fn default_workers() -> usize {
    10
}

/// `[download]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSection {
    /// Directory where packages and the ledger are written.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Extension appended to downloaded package names.
    #[serde(default = "default_file_extension")]
    pub file_extension: String,

    /// Host serving `/packages/daily/...`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Calendar CSV endpoint; the year is appended as a path segment.
    #[serde(default = "default_calendar_url")]
    pub calendar_url: String,

    /// Years processed simultaneously.
    #[serde(default = "default_max_years")]
    pub max_concurrent_years: usize,

    /// Downloads in flight per year.
    #[serde(default = "default_max_downloads")]
    pub max_concurrent_downloads: usize,

    /// Pause between dispatches within a year.
    #[serde(default = "default_dispatch_delay")]
    pub dispatch_delay_ms: u64,

    /// Per-request timeout for calendar and package downloads.
    #[serde(default = "default_download_timeout")]
    pub timeout_secs: u64,

    /// Ledger file name, relative to `download_dir`.
    #[serde(default = "default_ledger_file")]
    pub ledger_file: String,
}

impl Default for DownloadSection {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            file_extension: default_file_extension(),
            base_url: default_base_url(),
            calendar_url: default_calendar_url(),
            max_concurrent_years: default_max_years(),
            max_concurrent_downloads: default_max_downloads(),
            dispatch_delay_ms: default_dispatch_delay(),
            timeout_secs: default_download_timeout(),
            ledger_file: default_ledger_file(),
        }
    }
}

fn default_download_dir() -> String {
    "./downloads".into()
}
fn default_file_extension() -> String {
    ".tar.gz".into()
}
fn default_base_url() -> String {
    "https://ted.europa.eu".into()
}
fn default_calendar_url() -> String {
    "https://ted.europa.eu/es/release-calendar/-/download/file/CSV".into()
}
fn default_max_years() -> usize {
    2
}
fn default_max_downloads() -> usize {
    3
}
fn default_dispatch_delay() -> u64 {
    2_000
}
fn default_download_timeout() -> u64 {
    600
}
fn default_ledger_file() -> String {
    "processed_publications.txt".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime search engine configuration.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub url: String,
    pub index: String,
    pub credentials: Credentials,
    pub field_limit: u64,
    pub timeout: Duration,
}

impl From<&AppConfig> for SearchConfig {
    fn from(config: &AppConfig) -> Self {
        let password = std::env::var(&config.search.password_env)
            .ok()
            .filter(|p| !p.is_empty());
        Self {
            url: config.search.url.clone(),
            index: config.search.index.clone(),
            credentials: Credentials {
                username: config.search.username.clone(),
                password,
            },
            field_limit: config.search.field_limit,
            timeout: Duration::from_secs(config.search.timeout_secs),
        }
    }
}

/// Runtime ingestion configuration.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub search: SearchConfig,
    /// Documents per bulk request (at least 1).
    pub bulk_size: usize,
    /// Concurrent normalization workers (at least 1).
    pub workers: usize,
}

impl From<&AppConfig> for IngestConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            search: SearchConfig::from(config),
            bulk_size: config.ingest.bulk_size.max(1),
            workers: config.ingest.workers.max(1),
        }
    }
}

/// Runtime download/scheduling configuration.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub download_dir: PathBuf,
    pub file_extension: String,
    pub base_url: String,
    pub calendar_url: String,
    pub max_concurrent_years: usize,
    pub max_concurrent_downloads: usize,
    pub dispatch_delay: Duration,
    pub timeout: Duration,
    /// Full path of the completion ledger.
    pub ledger_path: PathBuf,
}

impl From<&AppConfig> for DownloadConfig {
    fn from(config: &AppConfig) -> Self {
        let section = &config.download;
        let download_dir = PathBuf::from(&section.download_dir);
        Self {
            ledger_path: download_dir.join(&section.ledger_file),
            download_dir,
            file_extension: section.file_extension.clone(),
            base_url: section.base_url.clone(),
            calendar_url: section.calendar_url.clone(),
            max_concurrent_years: section.max_concurrent_years.max(1),
            max_concurrent_downloads: section.max_concurrent_downloads.max(1),
            dispatch_delay: Duration::from_millis(section.dispatch_delay_ms),
            timeout: Duration::from_secs(section.timeout_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.tedsync/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TedSyncError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.tedsync/tedsync.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TedSyncError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| TedSyncError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TedSyncError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TedSyncError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TedSyncError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("download_dir"));
        assert!(toml_str.contains("OPENSEARCH_PASSWORD"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[search]
url = "https://search.internal:9200"

[download]
max_concurrent_years = 4
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.search.url, "https://search.internal:9200");
        assert_eq!(config.search.index, "ted");
        assert_eq!(config.ingest.bulk_size, 100);
        assert_eq!(config.download.max_concurrent_years, 4);
        assert_eq!(config.download.file_extension, ".tar.gz");
    }

    #[test]
    fn runtime_configs_from_app_config() {
        let mut app = AppConfig::default();
        app.ingest.workers = 0;
        app.download.download_dir = "/data/ted".into();

        let ingest = IngestConfig::from(&app);
        assert_eq!(ingest.workers, 1);
        assert_eq!(ingest.bulk_size, 100);
        assert_eq!(ingest.search.field_limit, 30_000);

        let download = DownloadConfig::from(&app);
        assert_eq!(
            download.ledger_path,
            PathBuf::from("/data/ted/processed_publications.txt")
        );
        assert_eq!(download.dispatch_delay, Duration::from_secs(2));
    }

    #[test]
    fn password_read_from_named_env_var() {
        let mut app = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        app.search.password_env = "TEDSYNC_TEST_NONEXISTENT_PASSWORD_12345".into();
        app.search.username = Some("admin".into());
        let search = SearchConfig::from(&app);
        assert!(search.credentials.password.is_none());
        assert!(search.credentials.basic_auth().is_none());
    }
}
