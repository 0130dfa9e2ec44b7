// IPC configuration loaded from a JSON file in the user's config directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "LABCTL_CONFIG";

const CONFIG_FILE_NAME: &str = "ipc.json";
const MAX_PREFIX_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Config directory not accessible")]
    ConfigDirError,
    #[error("Invalid setting '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Tunables for the shared-memory queue, the segment pool and the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Maximum number of payload segments alive at the same time.
    pub max_segments: usize,
    pub max_payload_size: usize,
    /// Upper bound for any single string, line run or blob on the control channel.
    pub max_message_size: usize,
    pub shm_prefix: String,
    /// Granularity at which blocking waits re-check for a termination request.
    pub poll_interval_ms: u64,
    pub acquire_retries: u32,
    pub acquire_backoff_ms: u64,
    pub idle_tick_ms: u64,
    pub worker_executable: Option<PathBuf>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_segments: 32,
            max_payload_size: 1024 * 1024,
            max_message_size: 1024 * 1024, // 1MB safety limit
            shm_prefix: default_prefix(),
            poll_interval_ms: 50,
            acquire_retries: 200,
            acquire_backoff_ms: 10,
            idle_tick_ms: 20,
            worker_executable: None,
        }
    }
}

fn default_prefix() -> String {
    format!("labctl-{}", nix::unistd::getuid())
}

impl IpcConfig {
    /// Load the config from `$LABCTL_CONFIG` or the default location.
    /// A missing file yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => default_config_path()?,
        };
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str::<IpcConfig>(&content)?
        } else {
            log::debug!("[CONFIG] {:?} not found, using defaults", path);
            IpcConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_segments == 0 || self.max_segments > i32::MAX as usize - 1 {
            return Err(ConfigError::Invalid {
                field: "max_segments",
                reason: format!("{} is out of range", self.max_segments),
            });
        }
        if self.max_payload_size == 0 {
            return Err(ConfigError::Invalid {
                field: "max_payload_size",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_message_size == 0 || self.max_message_size > i32::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "max_message_size",
                reason: format!("{} is out of range", self.max_message_size),
            });
        }
        if self.shm_prefix.is_empty()
            || self.shm_prefix.len() > MAX_PREFIX_LEN
            || self.shm_prefix.contains('/')
        {
            return Err(ConfigError::Invalid {
                field: "shm_prefix",
                reason: format!("'{}' is not a usable shm name prefix", self.shm_prefix),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "poll_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Queue capacity: one slot per live segment plus one spare.
    pub fn queue_capacity(&self) -> usize {
        self.max_segments + 1
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn acquire_backoff(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_ms)
    }

    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("labctl").join(CONFIG_FILE_NAME))
        .ok_or(ConfigError::ConfigDirError)
}

#[cfg(test)]
impl IpcConfig {
    /// Small pool under a unique prefix so parallel tests never share names.
    pub(crate) fn isolated() -> Self {
        Self {
            shm_prefix: format!(
                "labctl-test-{}",
                &uuid::Uuid::new_v4().simple().to_string()[..12]
            ),
            max_segments: 4,
            max_payload_size: 4096,
            max_message_size: 4096,
            poll_interval_ms: 5,
            acquire_retries: 20,
            acquire_backoff_ms: 2,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = IpcConfig::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, IpcConfig::default());
        assert_eq!(config.queue_capacity(), 33);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipc.json");
        fs::write(&path, r#"{ "max_segments": 4, "shm_prefix": "bench" }"#).unwrap();

        let config = IpcConfig::load_from(&path).unwrap();
        assert_eq!(config.max_segments, 4);
        assert_eq!(config.shm_prefix, "bench");
        assert_eq!(config.poll_interval_ms, 50);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ipc.json");
        let mut config = IpcConfig::default();
        config.idle_tick_ms = 5;
        config.save_to(&path).unwrap();
        assert_eq!(IpcConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = IpcConfig::default();
        config.max_segments = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "max_segments", .. })
        ));

        let mut config = IpcConfig::default();
        config.shm_prefix = "a/b".to_string();
        assert!(config.validate().is_err());
    }
}
