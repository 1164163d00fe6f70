//! Configuration for downloads and uploads.
//!
//! A [`FungetConfig`] can be built from defaults, a JSON value or file, or
//! the process environment (`FUNGET_*` variables layered over defaults). It
//! serializes back to JSON with the same field names.
//!
//! Sizes are given in the units a person would type: `block_size` is in MiB,
//! timeouts are in seconds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::download::TransferOptions;
use crate::download::constants::{
    DEFAULT_CAPACITY, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_RETRIES, DEFAULT_MIN_MULTI_SIZE,
    DEFAULT_TIMEOUT, DEFAULT_WORKER_LIMIT, MIB,
};
use crate::upload::{
    DEFAULT_UPLOAD_CHUNK_SIZE, DEFAULT_UPLOAD_MAX_RETRIES, DEFAULT_UPLOAD_TIMEOUT, UploadMethod,
    UploadOptions,
};

/// Prefix of every environment variable read by [`FungetConfig::from_env`].
pub const ENV_PREFIX: &str = "FUNGET_";

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        /// Config file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The JSON did not match the config schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment variable held a value of the wrong type.
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv {
        /// Variable name.
        name: String,
        /// Raw value.
        value: String,
    },

    /// A value is outside its allowed range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u64,
        /// Allowed range.
        expected: &'static str,
    },
}

/// Download defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    /// Requested block workers.
    pub worker_num: usize,
    /// Upper bound on in-flight blocks.
    pub capacity: usize,
    /// Block size in MiB.
    pub block_size: u64,
    /// Attempts per block or stream.
    pub max_retries: u32,
    /// Per-request timeout in seconds.
    pub timeout: u64,
    /// Replace existing destination files.
    pub overwrite: bool,
    /// Create missing parent directories.
    pub create_dirs: bool,
    /// Single-stream write buffer in bytes.
    pub chunk_size: usize,
    /// Smallest size in bytes fetched in blocks.
    pub min_multi_size: u64,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            worker_num: DEFAULT_WORKER_LIMIT,
            capacity: DEFAULT_CAPACITY,
            block_size: 100,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT.as_secs(),
            overwrite: false,
            create_dirs: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_multi_size: DEFAULT_MIN_MULTI_SIZE,
            headers: BTreeMap::new(),
        }
    }
}

impl DownloadConfig {
    /// Checks every value against the ranges the engines accept.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("download.worker_num", self.worker_num as u64, 1, 1000, "1..=1000")?;
        check_range("download.capacity", self.capacity as u64, 1, 10_000, "1..=10000")?;
        check_range("download.block_size", self.block_size, 1, 1 << 20, "1..=1048576")?;
        check_range("download.max_retries", u64::from(self.max_retries), 1, 100, "1..=100")?;
        check_range("download.timeout", self.timeout, 1, 86_400, "1..=86400")?;
        check_range("download.chunk_size", self.chunk_size as u64, 1, 1 << 30, "1..=1073741824")?;
        Ok(())
    }

    /// Converts to engine options.
    #[must_use]
    pub fn to_transfer_options(&self) -> TransferOptions {
        TransferOptions {
            headers: self.headers.clone(),
            timeout: Duration::from_secs(self.timeout),
            max_retries: self.max_retries,
            overwrite: self.overwrite,
            block_size: self.block_size.saturating_mul(MIB),
            worker_limit: self.worker_num,
            capacity: self.capacity,
            create_dirs: self.create_dirs,
            chunk_size: self.chunk_size,
            min_multi_size: self.min_multi_size,
            ..TransferOptions::default()
        }
    }
}

/// Upload defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Body read size in bytes.
    pub chunk_size: usize,
    /// Attempts per upload.
    pub max_retries: u32,
    /// Per-attempt timeout in seconds.
    pub timeout: u64,
    /// HTTP method.
    pub method: UploadMethod,
    /// Extra request headers.
    pub headers: BTreeMap<String, String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            max_retries: DEFAULT_UPLOAD_MAX_RETRIES,
            timeout: DEFAULT_UPLOAD_TIMEOUT.as_secs(),
            method: UploadMethod::default(),
            headers: BTreeMap::new(),
        }
    }
}

impl UploadConfig {
    /// Checks every value against the ranges the uploader accepts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("upload.chunk_size", self.chunk_size as u64, 1, 1 << 30, "1..=1073741824")?;
        check_range("upload.max_retries", u64::from(self.max_retries), 1, 100, "1..=100")?;
        check_range("upload.timeout", self.timeout, 1, 86_400, "1..=86400")?;
        Ok(())
    }

    /// Converts to uploader options.
    #[must_use]
    pub fn to_upload_options(&self) -> UploadOptions {
        UploadOptions {
            method: self.method,
            headers: self.headers.clone(),
            chunk_size: self.chunk_size,
            max_retries: self.max_retries,
            timeout: Duration::from_secs(self.timeout),
            ..UploadOptions::default()
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FungetConfig {
    /// Download defaults.
    pub download: DownloadConfig,
    /// Upload defaults.
    pub upload: UploadConfig,
    /// Log level name (`TRACE`, `DEBUG`, `INFO`, `WARN`, `ERROR`).
    pub log_level: String,
    /// Show a progress bar in the terminal.
    pub progress_bar: bool,
}

impl Default for FungetConfig {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
            log_level: "INFO".to_string(),
            progress_bar: true,
        }
    }
}

impl FungetConfig {
    /// Builds a config from a JSON value; missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for unknown fields or wrong types, and
    /// [`ConfigError::OutOfRange`] for invalid values.
    pub fn from_value(value: Value) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`FungetConfig::from_value`].
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Defaults overlaid with `FUNGET_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Overlays variables returned by `lookup` (keyed by full name, e.g.
    /// `FUNGET_WORKER_NUM`) onto `self`. Empty values are ignored.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `FUNGET_WORKER_NUM` | `download.worker_num` |
    /// | `FUNGET_CAPACITY` | `download.capacity` |
    /// | `FUNGET_BLOCK_SIZE` | `download.block_size` |
    /// | `FUNGET_MAX_RETRIES` | `download.max_retries` |
    /// | `FUNGET_TIMEOUT` | `download.timeout` |
    /// | `FUNGET_OVERWRITE` | `download.overwrite` |
    /// | `FUNGET_CREATE_DIRS` | `download.create_dirs` |
    /// | `FUNGET_CHUNK_SIZE` | `download.chunk_size` |
    /// | `FUNGET_UPLOAD_CHUNK_SIZE` | `upload.chunk_size` |
    /// | `FUNGET_UPLOAD_MAX_RETRIES` | `upload.max_retries` |
    /// | `FUNGET_UPLOAD_TIMEOUT` | `upload.timeout` |
    /// | `FUNGET_UPLOAD_METHOD` | `upload.method` |
    /// | `FUNGET_LOG_LEVEL` | `log_level` |
    /// | `FUNGET_PROGRESS_BAR` | `progress_bar` |
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if a variable cannot be parsed.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| -> Option<(String, String)> {
            let name = format!("{ENV_PREFIX}{key}");
            let value = lookup(&name)?;
            let value = value.trim().to_string();
            if value.is_empty() {
                None
            } else {
                Some((name, value))
            }
        };

        let d = &mut self.download;
        set_parsed(get("WORKER_NUM"), &mut d.worker_num)?;
        set_parsed(get("CAPACITY"), &mut d.capacity)?;
        set_parsed(get("BLOCK_SIZE"), &mut d.block_size)?;
        set_parsed(get("MAX_RETRIES"), &mut d.max_retries)?;
        set_parsed(get("TIMEOUT"), &mut d.timeout)?;
        set_bool(get("OVERWRITE"), &mut d.overwrite)?;
        set_bool(get("CREATE_DIRS"), &mut d.create_dirs)?;
        set_parsed(get("CHUNK_SIZE"), &mut d.chunk_size)?;

        let u = &mut self.upload;
        set_parsed(get("UPLOAD_CHUNK_SIZE"), &mut u.chunk_size)?;
        set_parsed(get("UPLOAD_MAX_RETRIES"), &mut u.max_retries)?;
        set_parsed(get("UPLOAD_TIMEOUT"), &mut u.timeout)?;
        if let Some((name, value)) = get("UPLOAD_METHOD") {
            u.method = value
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { name, value })?;
        }

        if let Some((_, value)) = get("LOG_LEVEL") {
            self.log_level = value.to_ascii_uppercase();
        }
        set_bool(get("PROGRESS_BAR"), &mut self.progress_bar)?;
        Ok(())
    }

    /// Serializes the config to JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if serialization fails.
    pub fn to_value(&self) -> Result<Value, ConfigError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Validates both sections.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.download.validate()?;
        self.upload.validate()
    }
}

fn check_range(
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
    expected: &'static str,
) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            expected,
        })
    }
}

fn set_parsed<T: std::str::FromStr>(
    entry: Option<(String, String)>,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some((name, value)) = entry {
        *slot = value
            .parse()
            .map_err(|_| ConfigError::InvalidEnv { name, value })?;
    }
    Ok(())
}

fn set_bool(entry: Option<(String, String)>, slot: &mut bool) -> Result<(), ConfigError> {
    if let Some((name, value)) = entry {
        *slot = match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => return Err(ConfigError::InvalidEnv { name, value }),
        };
    }
    Ok(())
}
