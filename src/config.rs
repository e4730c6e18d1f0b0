//! Daemon configuration.
//!
//! The daemon reads a small YAML (or JSON) document describing where sandbox
//! roots and state live, which sandboxer is used when a request names none,
//! and how the reference process controller launches pause processes.
//!
//! ```yaml
//! root_path: /var/lib/magikpod
//! state_path: /run/magikpod
//! default_sandboxer: process
//! pause_command: ["/pause"]
//! stop_timeout_secs: 10
//! controller_timeout_secs: 60
//! ```
//!
//! Every field is optional; missing fields take the platform defaults.

use crate::constants::{
    CONTROLLER_CALL_TIMEOUT, DEFAULT_STOP_TIMEOUT, MAX_CONFIG_SIZE, SANDBOX_SUBDIR,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the sandboxer backed by [`crate::sandbox::ProcessController`].
pub const PROCESS_SANDBOXER: &str = "process";

/// Default pause program run by the process controller.
pub const DEFAULT_PAUSE_PROGRAM: &str = "/pause";

/// Returns the platform-appropriate base directory for persistent data.
///
/// - Linux: `/var/lib/magikpod`
/// - Elsewhere: `~/.magikpod/lib`
pub fn default_root_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/lib/magikpod")
    }

    #[cfg(not(target_os = "linux"))]
    {
        dirs::home_dir()
            .map(|h| h.join(".magikpod").join("lib"))
            .unwrap_or_else(|| PathBuf::from(".magikpod/lib"))
    }
}

/// Returns the platform-appropriate base directory for runtime state.
///
/// - Linux: `/run/magikpod` (tmpfs)
/// - Elsewhere: `~/.magikpod/run`
pub fn default_state_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/run/magikpod")
    }

    #[cfg(not(target_os = "linux"))]
    {
        dirs::home_dir()
            .map(|h| h.join(".magikpod").join("run"))
            .unwrap_or_else(|| PathBuf::from(".magikpod/run"))
    }
}

/// Daemon-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Base directory for sandbox root dirs (`<root_path>/sandbox/<id>`).
    pub root_path: PathBuf,
    /// Base directory for sandbox state dirs (`<state_path>/sandbox/<id>`).
    pub state_path: PathBuf,
    /// Sandboxer used when a request does not name one.
    pub default_sandboxer: String,
    /// Pause command for the process controller (program followed by args).
    pub pause_command: Vec<String>,
    /// Stop timeout used when a stop request carries none.
    pub stop_timeout_secs: u32,
    /// Bound for controller calls other than stop.
    pub controller_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
            state_path: default_state_path(),
            default_sandboxer: PROCESS_SANDBOXER.to_string(),
            pause_command: vec![DEFAULT_PAUSE_PROGRAM.to_string()],
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT,
            controller_timeout_secs: CONTROLLER_CALL_TIMEOUT.as_secs(),
        }
    }
}

impl DaemonConfig {
    /// Parses a daemon config from YAML bytes.
    ///
    /// # Errors
    ///
    /// - Size exceeds `MAX_CONFIG_SIZE`
    /// - YAML parsing fails
    /// - Validation fails (see [`DaemonConfig::validate`])
    pub fn from_yaml(yaml: &[u8]) -> Result<Self> {
        if yaml.len() > MAX_CONFIG_SIZE {
            return Err(Error::Config(format!(
                "config size {} exceeds limit of {}",
                yaml.len(),
                MAX_CONFIG_SIZE
            )));
        }

        // An empty document means "all defaults".
        if yaml.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let config: Self =
            serde_yaml::from_slice(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a daemon config from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&bytes)
    }

    /// Checks field-level invariants.
    pub fn validate(&self) -> Result<()> {
        if self.root_path.as_os_str().is_empty() {
            return Err(Error::Config("root_path cannot be empty".to_string()));
        }
        if self.state_path.as_os_str().is_empty() {
            return Err(Error::Config("state_path cannot be empty".to_string()));
        }
        if self.default_sandboxer.is_empty() {
            return Err(Error::Config("default_sandboxer cannot be empty".to_string()));
        }
        if self.pause_command.first().is_none_or(|p| p.is_empty()) {
            return Err(Error::Config("pause_command needs a program".to_string()));
        }
        if self.controller_timeout_secs == 0 {
            return Err(Error::Config(
                "controller_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding all sandbox root dirs.
    pub fn sandbox_root_base(&self) -> PathBuf {
        self.root_path.join(SANDBOX_SUBDIR)
    }

    /// Directory holding all sandbox state dirs.
    pub fn sandbox_state_base(&self) -> PathBuf {
        self.state_path.join(SANDBOX_SUBDIR)
    }

    /// Controller call bound as a `Duration`.
    pub fn controller_timeout(&self) -> Duration {
        Duration::from_secs(self.controller_timeout_secs)
    }
}
