pub mod device;
pub mod mount;
pub mod statfs;

pub use device::LinuxDriveFormatter;
pub use mount::LinuxDriveMounter;
pub use statfs::LinuxDriveStatter;

use drivekeeper_core::DriveError;

pub(crate) fn errno_error(context: &str, errno: nix::errno::Errno) -> DriveError {
    DriveError::Other(format!("{}: {}", context, std::io::Error::from(errno)))
}

/// Runs a blocking syscall wrapper off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, DriveError>
where
    F: FnOnce() -> Result<T, DriveError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DriveError::Other(format!("blocking task failed: {}", e)))?
}
