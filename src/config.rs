//! Client configuration, read from TOML.
//!
//! ```toml
//! root = "/home/me/Shared"
//! exclude = ["*.log", "build/**"]
//! use_default_excludes = true
//!
//! [retry]
//! initial_delay_ms = 250
//! max_delay_ms = 5000
//! multiplier = 2.0
//! max_attempts = 40   # 0 retries until shutdown
//!
//! [echo]
//! ttl_secs = 120      # 0 keeps registrations forever
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::sync::error::{Result, SyncError};
use crate::sync::exclude::{ExcludePatterns, IGNORE_FILE_NAME};
use crate::sync::readiness::RetryPolicy;
use crate::sync::suppression::DEFAULT_ECHO_TTL;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Directory to watch. A path given on the command line wins.
    pub root: Option<PathBuf>,
    pub exclude: Vec<String>,
    pub use_default_excludes: bool,
    pub retry: RetryConfig,
    pub echo: EchoConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_attempts: policy.max_attempts.unwrap_or(0),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        let initial_delay = Duration::from_millis(cfg.initial_delay_ms.max(1));
        Self {
            initial_delay,
            max_delay: Duration::from_millis(cfg.max_delay_ms).max(initial_delay),
            multiplier: if cfg.multiplier.is_finite() {
                cfg.multiplier.max(1.0)
            } else {
                1.0
            },
            max_attempts: (cfg.max_attempts > 0).then_some(cfg.max_attempts),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EchoConfig {
    pub ttl_secs: u64,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_ECHO_TTL.as_secs(),
        }
    }
}

impl EchoConfig {
    /// Registration lifetime; `None` when expiry is disabled.
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_secs > 0).then(|| Duration::from_secs(self.ttl_secs))
    }
}

impl ClientConfig {
    /// `<config dir>/hubsync/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hubsync").join("config.toml"))
    }

    pub fn from_toml(path: &Path, content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| SyncError::Config {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|err| SyncError::Config {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::from_toml(path, &content)
    }

    /// Load `path`, or the default location when `path` is `None`. A missing
    /// default file yields the built-in defaults; a missing explicit file is
    /// an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// Exclusion set from the configured patterns plus the defaults, if
    /// enabled.
    pub fn excludes(&self) -> Result<ExcludePatterns> {
        let mut excludes = ExcludePatterns::from_patterns(&self.exclude)?;
        if self.use_default_excludes {
            excludes.merge(&ExcludePatterns::with_defaults()?)?;
        }
        Ok(excludes)
    }

    /// Exclusion set for a watch over `root`: [`excludes`](Self::excludes)
    /// plus the patterns in `<root>/.hubsyncignore`, when that file exists.
    pub fn excludes_for(&self, root: &Path) -> Result<ExcludePatterns> {
        let mut excludes = self.excludes()?;

        let ignore_file = root.join(IGNORE_FILE_NAME);
        if ignore_file.is_file() {
            let content = fs::read_to_string(&ignore_file).map_err(|err| SyncError::Config {
                path: ignore_file.clone(),
                reason: err.to_string(),
            })?;
            excludes.merge(&ExcludePatterns::parse_ignore_file(&content)?)?;
        }

        Ok(excludes)
    }
}
