//! Global configuration model for the arbor daemon.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Error, Result};

/// Root configuration for the daemon.
///
/// Loaded once at startup; every field has a default so a missing or partial
/// config file still yields a working daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding one persistent record per container id.
    pub kvs_dir: PathBuf,
    /// Base directory for container working directories.
    pub work_dir: PathBuf,
    /// RPC socket path.
    pub socket_path: PathBuf,
    /// Maximum number of client-visible containers.
    pub max_containers: usize,
    /// Default period for the CPU bandwidth controller, nanoseconds.
    pub cpu_period_ns: u64,
    /// Host memory held back from the guarantee roll-up, bytes.
    pub memory_guarantee_reserve: u64,
    /// Soft limit applied to dead and hollow meta containers, bytes.
    pub dead_memory_soft_limit: u64,
    /// Whether dead subtrees get their soft limit squeezed.
    pub pressurize_on_death: bool,
    /// Whether cpu guarantees roll up through ancestors.
    pub propagate_cpu_guarantee: bool,
    /// How long a dead container lingers before aged destruction, milliseconds.
    pub default_aging_time_ms: u64,
    /// Delay before an automatic respawn, milliseconds.
    pub respawn_delay_ms: u64,
    /// Interval between stdio rotations, milliseconds.
    pub log_rotate_ms: u64,
    /// Default pids-controller limit for first-level containers; 0 disables.
    pub default_thread_limit: u64,
    /// Base RT priority for `cpu_policy=rt`; 0 keeps RT scheduling off.
    pub rt_priority: i32,
    /// Nice value for RT containers.
    pub rt_nice: i32,
    /// Nice boost subtracted for `high` and `iso` policies.
    pub high_nice: i32,
    /// Grace period for `Stop` before the kill escalation, milliseconds.
    pub stop_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            kvs_dir: PathBuf::from(constants::DEFAULT_KVS_DIR),
            work_dir: PathBuf::from(constants::DEFAULT_WORK_DIR),
            socket_path: PathBuf::from(constants::DEFAULT_SOCKET_PATH),
            max_containers: 3000,
            cpu_period_ns: 100_000_000,
            memory_guarantee_reserve: 2 << 30,
            dead_memory_soft_limit: 1 << 20,
            pressurize_on_death: false,
            propagate_cpu_guarantee: true,
            default_aging_time_ms: 24 * 60 * 60 * 1000,
            respawn_delay_ms: 1000,
            log_rotate_ms: 60_000,
            default_thread_limit: 10_000,
            rt_priority: 0,
            rt_nice: -10,
            high_nice: -10,
            stop_timeout_ms: 30_000,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from a JSON file.
    ///
    /// A missing file yields the defaults; a present but malformed file is an
    /// error so a typo cannot silently drop limits.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::system("read", &e).context(path.display()))?;
        let config: Self = serde_json::from_str(&content)?;
        tracing::debug!(path = %path.display(), "daemon config loaded");
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = DaemonConfig::load(Path::new("/nonexistent/arbord.json")).expect("defaults");
        assert_eq!(config.kvs_dir, PathBuf::from(constants::DEFAULT_KVS_DIR));
        assert!(config.max_containers > 0);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("arbord.json");
        std::fs::write(&path, r#"{"max_containers": 7}"#).expect("write");

        let config = DaemonConfig::load(&path).expect("load");
        assert_eq!(config.max_containers, 7);
        assert_eq!(config.cpu_period_ns, 100_000_000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("arbord.json");
        std::fs::write(&path, "max_containers = 7").expect("write");
        assert!(DaemonConfig::load(&path).is_err());
    }
}
