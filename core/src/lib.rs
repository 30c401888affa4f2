pub mod condition;
pub mod config;
pub mod device;
pub mod drive;
pub mod error;
pub mod reconcile;
pub mod repository;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::ControllerConfig;
pub use device::{DriveFormatter, DriveLayout, DriveMounter, DriveStatter};
pub use drive::{
    Condition, ConditionType, DriveObject, DriveSpec, DriveState, DriveStatus, ObjectMeta,
    RequestedFormat, DATA_PROTECTION_FINALIZER, FILESYSTEM_XFS, NODE_LABEL,
};
pub use error::DriveError;
pub use reconcile::{classify, DriveEventHandler, EventHandler, UpdateIntent};
pub use repository::{
    DriveRepository, DriveWatch, EventKind, LabelSelector, MemoryDriveRepository, WatchEvent,
};
pub use tokio_util::sync::CancellationToken;
