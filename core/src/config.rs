use crate::device::DriveLayout;
use crate::DriveError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_NODE_ID: &str = "DRIVEKEEPER_NODE_ID";
pub const ENV_MOUNT_ROOT: &str = "DRIVEKEEPER_MOUNT_ROOT";
pub const ENV_DEVICE_ROOT: &str = "DRIVEKEEPER_DEVICE_ROOT";
pub const ENV_WORKERS: &str = "DRIVEKEEPER_WORKERS";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControllerConfig {
    pub node_id: String,
    pub mount_root: PathBuf,
    pub device_root: PathBuf,
    pub workers: usize,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub log_filter: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let layout = DriveLayout::default();
        Self {
            node_id: String::new(),
            mount_root: layout.mount_root,
            device_root: layout.device_root,
            workers: 40,
            retry_initial_backoff_ms: 200,
            retry_max_backoff_ms: 10_000,
            log_filter: "info".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn load(path: &Path) -> Result<Self, DriveError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Applies `DRIVEKEEPER_*` environment overrides from the process
    /// environment.
    pub fn apply_env(&mut self) -> Result<(), DriveError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), DriveError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(node_id) = lookup(ENV_NODE_ID) {
            self.node_id = node_id;
        }
        if let Some(root) = lookup(ENV_MOUNT_ROOT) {
            self.mount_root = PathBuf::from(root);
        }
        if let Some(root) = lookup(ENV_DEVICE_ROOT) {
            self.device_root = PathBuf::from(root);
        }
        if let Some(workers) = lookup(ENV_WORKERS) {
            self.workers = workers.trim().parse().map_err(|_| {
                DriveError::Configuration(format!("{} must be a number, got '{}'", ENV_WORKERS, workers))
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), DriveError> {
        if self.node_id.trim().is_empty() {
            return Err(DriveError::Configuration("node id must not be empty".to_string()));
        }
        if self.workers == 0 {
            return Err(DriveError::Configuration("workers must be at least 1".to_string()));
        }
        if self.retry_max_backoff_ms < self.retry_initial_backoff_ms {
            return Err(DriveError::Configuration(format!(
                "retry_max_backoff_ms ({}) is smaller than retry_initial_backoff_ms ({})",
                self.retry_max_backoff_ms, self.retry_initial_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn layout(&self) -> DriveLayout {
        DriveLayout::new(self.device_root.clone(), self.mount_root.clone())
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.workers, 40);
        assert_eq!(config.mount_root, PathBuf::from("/var/lib/direct-csi/mnt"));
        assert_eq!(config.retry_initial_backoff(), Duration::from_millis(200));
        assert!(config.validate().is_err(), "empty node id must be rejected");
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "node_id": "worker-1", "workers": 4 }"#).unwrap();

        let config = ControllerConfig::load(&path).unwrap();
        assert_eq!(config.node_id, "worker-1");
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry_max_backoff_ms, 10_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_NODE_ID, "node-7"),
            (ENV_MOUNT_ROOT, "/mnt/drives"),
            (ENV_WORKERS, "8"),
        ]
        .into_iter()
        .collect();

        let mut config = ControllerConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.workers, 8);
        assert_eq!(config.layout().mount_path("u"), PathBuf::from("/mnt/drives/u"));
        assert_eq!(config.device_root, PathBuf::from("/dev"));
    }

    #[test]
    fn test_bad_worker_override() {
        let mut config = ControllerConfig::default();
        let err = config
            .apply_overrides(|key| (key == ENV_WORKERS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, DriveError::Configuration(_)));
    }

    #[test]
    fn test_validate_backoff_order() {
        let config = ControllerConfig {
            node_id: "n1".to_string(),
            retry_initial_backoff_ms: 500,
            retry_max_backoff_ms: 100,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
