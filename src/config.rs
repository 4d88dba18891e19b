//! Launcher configuration.
//!
//! Every field has a default taken from [`crate::constants`], so an empty
//! YAML document is a valid configuration:
//!
//! ```yaml
//! runtimeDir: /run/aos/runtime
//! numCooperateLaunches: 5
//! maxInstances: 64
//! installTimeoutSecs: 600
//! prepareTimeoutSecs: 30
//! startTimeoutSecs: 60
//! stopTimeoutSecs: 30
//! roundTimeoutSecs: 300
//! ```

use crate::constants::{
    DEFAULT_RUNTIME_DIR, INSTALL_TIMEOUT, INSTANCE_START_TIMEOUT, INSTANCE_STOP_TIMEOUT,
    MAX_NUM_INSTANCES, NUM_COOPERATE_LAUNCHES, PREPARE_TIMEOUT, ROUND_TIMEOUT,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Launcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LauncherConfig {
    /// Base directory for per-instance runtime directories.
    pub runtime_dir: PathBuf,
    /// Number of start/stop operations executed in parallel.
    pub num_cooperate_launches: usize,
    /// Maximum number of instances (at most [`MAX_NUM_INSTANCES`]).
    pub max_instances: usize,
    pub install_timeout_secs: u64,
    pub prepare_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub round_timeout_secs: u64,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            num_cooperate_launches: NUM_COOPERATE_LAUNCHES,
            max_instances: MAX_NUM_INSTANCES,
            install_timeout_secs: INSTALL_TIMEOUT.as_secs(),
            prepare_timeout_secs: PREPARE_TIMEOUT.as_secs(),
            start_timeout_secs: INSTANCE_START_TIMEOUT.as_secs(),
            stop_timeout_secs: INSTANCE_STOP_TIMEOUT.as_secs(),
            round_timeout_secs: ROUND_TIMEOUT.as_secs(),
        }
    }
}

/// Returns the default runtime directory.
///
/// The system location when running as root, otherwise a directory under
/// the user's runtime (or home) directory.
pub fn default_runtime_dir() -> PathBuf {
    let system = PathBuf::from(DEFAULT_RUNTIME_DIR);
    if std::env::var_os("USER").is_some_and(|u| u == "root") {
        return system;
    }

    dirs::runtime_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".magiklaunch")))
        .map(|base| base.join("runtime"))
        .unwrap_or(system)
}

impl LauncherConfig {
    /// Parses a YAML document and validates it.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// Checks bounds.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidArgument`] if a count or timeout is zero, or if
    /// `max_instances` exceeds [`MAX_NUM_INSTANCES`].
    pub fn validate(&self) -> Result<()> {
        if self.runtime_dir.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("runtimeDir cannot be empty".to_string()));
        }
        if self.num_cooperate_launches == 0 {
            return Err(Error::InvalidArgument(
                "numCooperateLaunches must be at least 1".to_string(),
            ));
        }
        if self.max_instances == 0 || self.max_instances > MAX_NUM_INSTANCES {
            return Err(Error::InvalidArgument(format!(
                "maxInstances must be in 1..={MAX_NUM_INSTANCES}"
            )));
        }

        let timeouts = [
            ("installTimeoutSecs", self.install_timeout_secs),
            ("prepareTimeoutSecs", self.prepare_timeout_secs),
            ("startTimeoutSecs", self.start_timeout_secs),
            ("stopTimeoutSecs", self.stop_timeout_secs),
            ("roundTimeoutSecs", self.round_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(Error::InvalidArgument(format!("{name} must be non-zero")));
        }

        Ok(())
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_secs(self.prepare_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout_secs)
    }
}
