/// Test utilities and mock device operations - NEVER touch real hardware
use crate::{DriveError, DriveFormatter, DriveMounter, DriveObject, DriveStatter, RequestedFormat};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One recorded call against [`MockDriveOps`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCall {
    MakeBlockFile { path: PathBuf, major: u32, minor: u32 },
    Format { uuid: String, source: PathBuf, force: bool },
    Mount { source: PathBuf, target: PathBuf, options: Vec<String> },
    Unmount { target: PathBuf },
    Stat { mountpoint: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceOp {
    MakeBlockFile,
    Format,
    Mount,
    Unmount,
    Stat,
}

/// Mock implementation of all device-operation capabilities.
///
/// Tracks block nodes and mounts so that idempotent operations behave like
/// the real ones, records every call, and fails any operation switched on
/// with [`MockDriveOps::fail`].
#[derive(Clone, Default)]
pub struct MockDriveOps {
    pub calls: Arc<Mutex<Vec<DeviceCall>>>,
    failing: Arc<Mutex<HashSet<DeviceOp>>>,
    mounts: Arc<Mutex<HashMap<PathBuf, PathBuf>>>,
    free_bytes: Arc<Mutex<u64>>,
}

impl MockDriveOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_free_bytes(free: u64) -> Self {
        let ops = Self::new();
        *ops.free_bytes.lock().unwrap() = free;
        ops
    }

    pub fn fail(&self, op: DeviceOp) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn recover(&self, op: DeviceOp) {
        self.failing.lock().unwrap().remove(&op);
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: DeviceOp) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.op() == op)
            .count()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.mounts.lock().unwrap().contains_key(target)
    }

    /// Pretends `source` is already mounted at `target`.
    pub fn preset_mount(&self, source: &Path, target: &Path) {
        self.mounts
            .lock()
            .unwrap()
            .insert(target.to_path_buf(), source.to_path_buf());
    }

    fn record(&self, call: DeviceCall) -> Result<(), DriveError> {
        let op = call.op();
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(&op) {
            return Err(DriveError::Other(format!("injected {:?} failure", op)));
        }
        Ok(())
    }
}

impl DeviceCall {
    pub fn op(&self) -> DeviceOp {
        match self {
            DeviceCall::MakeBlockFile { .. } => DeviceOp::MakeBlockFile,
            DeviceCall::Format { .. } => DeviceOp::Format,
            DeviceCall::Mount { .. } => DeviceOp::Mount,
            DeviceCall::Unmount { .. } => DeviceOp::Unmount,
            DeviceCall::Stat { .. } => DeviceOp::Stat,
        }
    }
}

#[async_trait::async_trait]
impl DriveFormatter for MockDriveOps {
    async fn make_block_file(&self, path: &Path, major: u32, minor: u32) -> Result<(), DriveError> {
        self.record(DeviceCall::MakeBlockFile {
            path: path.to_path_buf(),
            major,
            minor,
        })
    }

    async fn format_drive(&self, uuid: &str, source: &Path, force: bool) -> Result<(), DriveError> {
        self.record(DeviceCall::Format {
            uuid: uuid.to_string(),
            source: source.to_path_buf(),
            force,
        })
    }
}

#[async_trait::async_trait]
impl DriveMounter for MockDriveOps {
    async fn mount_drive(&self, source: &Path, target: &Path, options: &[String]) -> Result<(), DriveError> {
        self.record(DeviceCall::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            options: options.to_vec(),
        })?;
        self.preset_mount(source, target);
        Ok(())
    }

    async fn unmount_drive(&self, target: &Path) -> Result<(), DriveError> {
        self.record(DeviceCall::Unmount {
            target: target.to_path_buf(),
        })?;
        // Unmounting something that is not mounted is fine.
        self.mounts.lock().unwrap().remove(target);
        Ok(())
    }
}

#[async_trait::async_trait]
impl DriveStatter for MockDriveOps {
    async fn free_capacity(&self, mountpoint: &Path) -> Result<u64, DriveError> {
        self.record(DeviceCall::Stat {
            mountpoint: mountpoint.to_path_buf(),
        })?;
        Ok(*self.free_bytes.lock().unwrap())
    }
}

/// An `Available` drive owned by the controller with a pending format request.
pub fn format_request_drive(name: &str, node: &str, force: bool) -> DriveObject {
    let mut drive = DriveObject::new(name, node, 8, 16, 10 * 1_073_741_824);
    drive.spec.owned_by_controller = true;
    drive.spec.requested_format = Some(RequestedFormat {
        force,
        mount_options: vec!["noatime".to_string()],
    });
    drive
}
