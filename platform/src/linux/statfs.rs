use super::{blocking, errno_error};
use drivekeeper_core::{DriveError, DriveStatter};
use nix::sys::statvfs::statvfs;
use std::path::Path;

pub struct LinuxDriveStatter;

#[async_trait::async_trait]
impl DriveStatter for LinuxDriveStatter {
    async fn free_capacity(&self, mountpoint: &Path) -> Result<u64, DriveError> {
        let mountpoint = mountpoint.to_path_buf();
        blocking(move || {
            let stat = statvfs(mountpoint.as_path())
                .map_err(|errno| errno_error(&format!("statvfs {}", mountpoint.display()), errno))?;
            Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
        })
        .await
    }
}
