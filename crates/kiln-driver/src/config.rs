//! Driver configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kiln_common::{KilnError, KilnResult, RuntimeVersion};
use serde::{Deserialize, Serialize};

/// Configuration of the CLI-backed driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Runtime executable (`docker`, `podman`, or an absolute path).
    pub binary: PathBuf,
    /// Grace period before a stopped container is killed (seconds).
    pub stop_timeout: u64,
    /// Minimum runtime version accepted by `verify`.
    pub min_version: Option<RuntimeVersion>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
            stop_timeout: 10,
            min_version: None,
        }
    }
}

impl DriverConfig {
    /// Config file name under the user config directory.
    pub const FILE_NAME: &'static str = "driver.toml";

    /// Default location: `<config dir>/kiln/driver.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kiln").join(Self::FILE_NAME))
    }

    /// Load a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> KilnResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| KilnError::Config {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })
    }

    /// Load `path` if given, else the default location if it exists,
    /// else the built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn discover(path: Option<&Path>) -> KilnResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        match Self::default_path() {
            Some(default) if default.exists() => {
                tracing::debug!(path = %default.display(), "Loading driver config");
                Self::load(&default)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Use a different runtime executable.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Set the stop grace period in seconds.
    #[must_use]
    pub const fn with_stop_timeout(mut self, seconds: u64) -> Self {
        self.stop_timeout = seconds;
        self
    }

    /// Require at least `version` from the runtime.
    #[must_use]
    pub fn with_min_version(mut self, version: RuntimeVersion) -> Self {
        self.min_version = Some(version);
        self
    }

    /// The stop grace period.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }
}
