use std::path::{Path, PathBuf};
use std::time::Duration;

use roulette_adapters::{ApiCredentials, DEFAULT_API_BASE};
use roulette_core::SourceKind;
use roulette_storage::MIN_REQUEST_INTERVAL;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const DEFAULT_DOCUMENT_PATH: &str = "roulette2026.json";
pub const DEFAULT_SOURCES_PATH: &str = "sources.yaml";
pub const DEFAULT_USER_AGENT: &str = "roulette-sync/0.1";
pub const DEFAULT_SYNC_CRON: &str = "0 5 0 * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set to a non-empty value")]
    MissingCredential(&'static str),
    #[error("ROULETTE_SCHEDULER_ENABLED is not true; the watcher is disabled")]
    SchedulerDisabled,
    #[error("reading source registry {}: {source}", .path.display())]
    RegistryIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing source registry {}: {source}", .path.display())]
    RegistryParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub credentials: ApiCredentials,
    pub document_path: PathBuf,
    pub sources_path: PathBuf,
    pub api_base: String,
    pub page_fixtures: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_request_interval: Duration,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SyncConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingCredential(key))
        };
        let credentials = ApiCredentials::new(required("RA_USERNAME")?, required("RA_API_KEY")?);

        let interval_ms = lookup("ROULETTE_MIN_REQUEST_INTERVAL_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(MIN_REQUEST_INTERVAL.as_millis() as u64);

        Ok(Self {
            credentials,
            document_path: document_path_from(&lookup),
            sources_path: lookup("ROULETTE_SOURCES")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOURCES_PATH)),
            api_base: lookup("ROULETTE_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            page_fixtures: lookup("ROULETTE_PAGE_FIXTURES")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            user_agent: lookup("ROULETTE_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: lookup("ROULETTE_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            min_request_interval: Duration::from_millis(interval_ms).max(MIN_REQUEST_INTERVAL),
            scheduler_enabled: lookup("ROULETTE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: lookup("ROULETTE_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }
}

/// Document location without requiring credentials, for offline commands.
pub fn document_path_from_env() -> PathBuf {
    document_path_from(&|key: &str| std::env::var(key).ok())
}

fn document_path_from(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("ROULETTE_DOCUMENT")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOCUMENT_PATH))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source: SourceKind,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn enabled_by_default() -> bool {
    true
}

impl Default for SourceRegistry {
    fn default() -> Self {
        let entry = |source, enabled| SourceConfig {
            source,
            enabled,
            url: None,
            notes: None,
        };
        Self {
            sources: vec![
                entry(SourceKind::EventPage, true),
                entry(SourceKind::Forum, true),
                entry(SourceKind::EventSet, false),
            ],
        }
    }
}

impl SourceRegistry {
    /// A missing file means the built-in defaults; a file that cannot be read
    /// or parsed is an error.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no source registry; using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::RegistryIo {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::RegistryParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}
