use async_trait::async_trait;
use drivekeeper_core::{DriveError, DriveFormatter, DriveMounter, DriveStatter};
use std::path::Path;

/// Placeholder for targets without direct block-device support.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedDriveOps;

fn unsupported<T>(op: &str) -> Result<T, DriveError> {
    Err(DriveError::NotSupported(format!(
        "{} is only available on Linux",
        op
    )))
}

#[async_trait]
impl DriveFormatter for UnsupportedDriveOps {
    async fn make_block_file(&self, _path: &Path, _major: u32, _minor: u32) -> Result<(), DriveError> {
        unsupported("creating block files")
    }

    async fn format_drive(&self, _uuid: &str, _source: &Path, _force: bool) -> Result<(), DriveError> {
        unsupported("formatting")
    }
}

#[async_trait]
impl DriveMounter for UnsupportedDriveOps {
    async fn mount_drive(&self, _source: &Path, _target: &Path, _options: &[String]) -> Result<(), DriveError> {
        unsupported("mounting")
    }

    async fn unmount_drive(&self, _target: &Path) -> Result<(), DriveError> {
        unsupported("unmounting")
    }
}

#[async_trait]
impl DriveStatter for UnsupportedDriveOps {
    async fn free_capacity(&self, _mountpoint: &Path) -> Result<u64, DriveError> {
        unsupported("statfs")
    }
}
