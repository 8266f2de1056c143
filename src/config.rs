use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{Policy, ResourceEntry};
use crate::error::AtlasError;
use crate::store::Store;

pub const CONFIG_FILE_NAME: &str = "st-atlas.json";
pub const ENV_PREFIX: &str = "ST_ATLAS_DATASETS_";

pub const DEFAULT_IO_BUFFER_SIZE: usize = 8192;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 200;

/// On-disk configuration. Every field is optional; absent values fall back
/// to the environment, then to defaults.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub download_policy: Option<Policy>,
    #[serde(default)]
    pub extract_policy: Option<Policy>,
    #[serde(default)]
    pub validate_checksums: Option<bool>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub io_buffer_size: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub disable_progress_bar: Option<bool>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceEntry>,
}

/// Everything [`crate::manager::DownloadManager`] needs, resolved and
/// validated.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub download_policy: Policy,
    pub extract_policy: Policy,
    pub validate_checksums: bool,
    pub cache_dir: Utf8PathBuf,
    pub max_workers: usize,
    pub io_buffer_size: usize,
    /// Total attempts per transfer, first one included.
    pub max_attempts: u32,
    pub fetch_timeout: Duration,
    /// Backoff unit; attempt `n` waits `n * retry_delay`.
    pub retry_delay: Duration,
    pub show_progress: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_policy: Policy::Missing,
            extract_policy: Policy::Missing,
            validate_checksums: true,
            cache_dir: Store::default_root(),
            max_workers: default_workers(),
            io_buffer_size: DEFAULT_IO_BUFFER_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            show_progress: true,
        }
    }
}

impl DownloadConfig {
    pub fn with_cache_dir(cache_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub download: DownloadConfig,
    pub resources: BTreeMap<String, ResourceEntry>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path` (or `st-atlas.json` if present), applies the process
    /// environment, and validates the result.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, AtlasError> {
        let mut settings = Self::read_settings(path)?;
        Self::apply_env(&mut settings, std::env::vars())?;
        Self::resolve_settings(settings)
    }

    pub fn read_settings(path: Option<&str>) -> Result<Settings, AtlasError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };
        if path.is_none() && !config_path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| AtlasError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| AtlasError::ConfigParse(err.to_string()))
    }

    /// Overrides `settings` with `ST_ATLAS_DATASETS_*` variables from `vars`.
    pub fn apply_env<I>(settings: &mut Settings, vars: I) -> Result<(), AtlasError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "DATA_DIR" => settings.data_dir = Some(value),
                "DOWNLOAD_POLICY" => settings.download_policy = Some(value.parse()?),
                "EXTRACT_POLICY" => settings.extract_policy = Some(value.parse()?),
                "VALIDATE_CHECKSUMS" => {
                    settings.validate_checksums = Some(parse_flag(&key, &value)?)
                }
                "DISABLE_PROGRESS_BAR" => {
                    settings.disable_progress_bar = Some(parse_flag(&key, &value)?)
                }
                "MAX_THREADS" => settings.max_workers = Some(parse_number(&key, &value)?),
                "IO_BUFFER_SIZE" => settings.io_buffer_size = Some(parse_number(&key, &value)?),
                "MAX_ATTEMPTS" => settings.max_attempts = Some(parse_number(&key, &value)?),
                "FETCH_TIMEOUT_SECS" => {
                    settings.fetch_timeout_secs = Some(parse_number(&key, &value)?)
                }
                _ => tracing::warn!(variable = %key, "ignoring unknown setting"),
            }
        }
        Ok(())
    }

    pub fn resolve_settings(settings: Settings) -> Result<ResolvedConfig, AtlasError> {
        let defaults = DownloadConfig::default();

        let cache_dir = match settings.data_dir {
            Some(dir) if dir.trim().is_empty() => {
                return Err(AtlasError::InvalidConfig("data_dir must not be empty".to_string()));
            }
            Some(dir) => Utf8PathBuf::from(dir.trim()),
            None => defaults.cache_dir,
        };

        let download = DownloadConfig {
            download_policy: settings.download_policy.unwrap_or(defaults.download_policy),
            extract_policy: settings.extract_policy.unwrap_or(defaults.extract_policy),
            validate_checksums: settings
                .validate_checksums
                .unwrap_or(defaults.validate_checksums),
            cache_dir,
            max_workers: positive("max_workers", settings.max_workers, defaults.max_workers)?,
            io_buffer_size: positive(
                "io_buffer_size",
                settings.io_buffer_size,
                defaults.io_buffer_size,
            )?,
            max_attempts: positive("max_attempts", settings.max_attempts, defaults.max_attempts)?,
            fetch_timeout: Duration::from_secs(positive(
                "fetch_timeout_secs",
                settings.fetch_timeout_secs,
                DEFAULT_FETCH_TIMEOUT_SECS,
            )?),
            retry_delay: settings
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            show_progress: !settings.disable_progress_bar.unwrap_or(false),
        };

        Ok(ResolvedConfig {
            download,
            resources: settings.resources,
        })
    }
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4)
}

fn positive<N>(field: &str, value: Option<N>, default: N) -> Result<N, AtlasError>
where
    N: PartialOrd + Default + Copy + std::fmt::Display,
{
    let value = value.unwrap_or(default);
    if value <= N::default() {
        return Err(AtlasError::InvalidConfig(format!(
            "{field} must be greater than zero (got {value})"
        )));
    }
    Ok(value)
}

fn parse_flag(key: &str, value: &str) -> Result<bool, AtlasError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AtlasError::InvalidConfig(format!(
            "{key}: expected a boolean, got '{value}'"
        ))),
    }
}

fn parse_number<N: std::str::FromStr>(key: &str, value: &str) -> Result<N, AtlasError> {
    value.trim().parse().map_err(|_| {
        AtlasError::InvalidConfig(format!("{key}: expected a positive integer, got '{value}'"))
    })
}
