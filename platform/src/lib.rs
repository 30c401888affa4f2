#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(not(target_os = "linux"))]
pub mod unsupported;

#[cfg(target_os = "linux")]
pub use linux::{
    LinuxDriveFormatter as PlatformDriveFormatter, LinuxDriveMounter as PlatformDriveMounter,
    LinuxDriveStatter as PlatformDriveStatter,
};

#[cfg(not(target_os = "linux"))]
pub use unsupported::{
    UnsupportedDriveOps as PlatformDriveFormatter, UnsupportedDriveOps as PlatformDriveMounter,
    UnsupportedDriveOps as PlatformDriveStatter,
};
