use crate::DriveError;
use std::path::{Path, PathBuf};

/// Creates block nodes and filesystems.
#[async_trait::async_trait]
pub trait DriveFormatter: Send + Sync {
    /// Ensures a block special file for `major:minor` exists at `path`.
    /// Creating a node that already exists is not an error.
    async fn make_block_file(&self, path: &Path, major: u32, minor: u32) -> Result<(), DriveError>;

    async fn format_drive(&self, uuid: &str, source: &Path, force: bool) -> Result<(), DriveError>;
}

#[async_trait::async_trait]
pub trait DriveMounter: Send + Sync {
    async fn mount_drive(&self, source: &Path, target: &Path, options: &[String]) -> Result<(), DriveError>;

    /// Unmounting a path that is not mounted succeeds.
    async fn unmount_drive(&self, target: &Path) -> Result<(), DriveError>;
}

#[async_trait::async_trait]
pub trait DriveStatter: Send + Sync {
    /// Free bytes available on the filesystem mounted at `mountpoint`.
    async fn free_capacity(&self, mountpoint: &Path) -> Result<u64, DriveError>;
}

/// Where the controller places the block nodes and mountpoints it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveLayout {
    pub device_root: PathBuf,
    pub mount_root: PathBuf,
}

impl DriveLayout {
    pub fn new(device_root: impl Into<PathBuf>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            device_root: device_root.into(),
            mount_root: mount_root.into(),
        }
    }

    pub fn block_path(&self, id: &str) -> PathBuf {
        self.device_root.join(format!("directcsi-{}", id))
    }

    pub fn mount_path(&self, id: &str) -> PathBuf {
        self.mount_root.join(id)
    }
}

impl Default for DriveLayout {
    fn default() -> Self {
        Self::new("/dev", "/var/lib/direct-csi/mnt")
    }
}
