//! Drive reconciliation.
//!
//! [`DriveEventHandler`] turns Add/Update/Delete notifications for a drive
//! into block-node, format, mount and unmount operations and persists the
//! resulting status, conditions and finalizers.
//!
//! The handler is state driven: every call recomputes what to do from the
//! object it is given, so re-running it after a failure or a lost write is
//! always safe. It never retries internally. A returned error (including an
//! optimistic-concurrency conflict on the final write) means the caller
//! should redeliver the event against the latest stored object; backoff and
//! retry limits belong to the caller.

use crate::condition::{apply_conditions, drive_conditions};
use crate::device::{DriveFormatter, DriveLayout, DriveMounter, DriveStatter};
use crate::drive::{
    DriveObject, DriveSpec, DriveStatus, RequestedFormat, DATA_PROTECTION_FINALIZER,
    FILESYSTEM_XFS,
};
use crate::repository::{DriveRepository, EventKind};
use crate::DriveError;
use chrono::Utc;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What an Add/Update notification is asking for, derived from `DriveSpec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateIntent {
    OwnAndFormat,
    Unknown,
}

pub fn classify(spec: &DriveSpec) -> UpdateIntent {
    if spec.owned_by_controller && spec.requested_format.is_some() {
        UpdateIntent::OwnAndFormat
    } else {
        UpdateIntent::Unknown
    }
}

/// Entry point the event dispatcher drives.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        kind: EventKind,
        drive: DriveObject,
    ) -> Result<(), DriveError>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    formatted: bool,
    mounted: bool,
}

pub struct DriveEventHandler {
    node_id: String,
    layout: DriveLayout,
    repository: Arc<dyn DriveRepository>,
    formatter: Arc<dyn DriveFormatter>,
    mounter: Arc<dyn DriveMounter>,
    statter: Arc<dyn DriveStatter>,
}

impl DriveEventHandler {
    pub fn new(
        node_id: impl Into<String>,
        repository: Arc<dyn DriveRepository>,
        formatter: Arc<dyn DriveFormatter>,
        mounter: Arc<dyn DriveMounter>,
        statter: Arc<dyn DriveStatter>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            layout: DriveLayout::default(),
            repository,
            formatter,
            mounter,
            statter,
        }
    }

    pub fn with_layout(mut self, layout: DriveLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn layout(&self) -> &DriveLayout {
        &self.layout
    }

    async fn update(&self, cancel: &CancellationToken, drive: DriveObject) -> Result<(), DriveError> {
        debug!(drive = %drive.name(), node = %self.node_id, "drive update called");
        match classify(&drive.spec) {
            UpdateIntent::OwnAndFormat => self.own_and_format(cancel, drive).await,
            UpdateIntent::Unknown => Err(DriveError::UnknownUpdateIntent(drive.name().to_string())),
        }
    }

    async fn own_and_format(
        &self,
        cancel: &CancellationToken,
        mut drive: DriveObject,
    ) -> Result<(), DriveError> {
        let Some(request) = drive.spec.requested_format.clone() else {
            return Err(DriveError::UnknownUpdateIntent(drive.name().to_string()));
        };

        if drive.status.drive_status != DriveStatus::Available {
            info!(
                drive = %drive.name(),
                status = %drive.status.drive_status,
                "rejected request to format drive"
            );
            return Ok(());
        }

        info!(drive = %drive.name(), force = request.force, "owning and formatting drive");

        let mut progress = Progress {
            formatted: drive.is_formatted(),
            mounted: drive.is_mounted(),
        };
        let update_err = match self
            .format_and_mount(cancel, &mut drive, &request, &mut progress)
            .await
        {
            Ok(()) => None,
            Err(DriveError::Cancelled) => return Err(DriveError::Cancelled),
            Err(e) => {
                error!(drive = %drive.name(), error = %e, "drive format pass failed");
                Some(e)
            }
        };

        let message = update_err.as_ref().map(ToString::to_string);
        apply_conditions(
            &mut drive.status.conditions,
            drive_conditions(progress.formatted, progress.mounted, message.as_deref()),
            Utc::now(),
        );

        if update_err.is_none() {
            drive.metadata.finalizers = vec![DATA_PROTECTION_FINALIZER.to_string()];
            drive.status.drive_status = DriveStatus::Ready;
            drive.spec.requested_format = None;
        }

        cancellable(cancel, self.repository.update(&drive)).await?;

        match update_err {
            Some(e) => Err(e),
            None => {
                info!(
                    drive = %drive.name(),
                    uuid = %drive.status.filesystem_uuid,
                    mountpoint = %drive.status.mountpoint,
                    "drive is ready"
                );
                Ok(())
            }
        }
    }

    /// Runs the physical steps in order, stopping at the first failure.
    /// `progress` holds what the persisted conditions will report.
    async fn format_and_mount(
        &self,
        cancel: &CancellationToken,
        drive: &mut DriveObject,
        request: &RequestedFormat,
        progress: &mut Progress,
    ) -> Result<(), DriveError> {
        let name = drive.name().to_string();

        let uuid = cancellable(cancel, self.resolve_filesystem_uuid(drive)).await?;
        drive.status.filesystem_uuid = uuid.clone();

        let source = self.layout.block_path(&uuid);
        let target = self.layout.mount_path(&uuid);

        cancellable(
            cancel,
            self.formatter.make_block_file(
                &source,
                drive.status.major_number,
                drive.status.minor_number,
            ),
        )
        .await
        .map_err(|e| device_error("create block file for", &name, e))?;

        if !progress.formatted || request.force {
            if progress.mounted {
                let mountpoint = PathBuf::from(&drive.status.mountpoint);
                cancellable(cancel, self.mounter.unmount_drive(&mountpoint))
                    .await
                    .map_err(|e| device_error("unmount", &name, e))?;
                drive.status.mountpoint.clear();
                drive.status.mount_options.clear();
                progress.mounted = false;
            }

            cancellable(cancel, self.formatter.format_drive(&uuid, &source, request.force))
                .await
                .map_err(|e| device_error("format", &name, e))?;
            drive.status.filesystem = FILESYSTEM_XFS.to_string();
            drive.status.allocated_capacity = 0;
            progress.formatted = true;
        }

        if progress.mounted {
            return Ok(());
        }

        cancellable(
            cancel,
            self.mounter.mount_drive(&source, &target, &request.mount_options),
        )
        .await
        .map_err(|e| device_error("mount", &name, e))?;
        drive.status.mountpoint = target.to_string_lossy().into_owned();
        drive.status.mount_options = request.mount_options.clone();

        // Mounted is only reported once capacity is known; the recorded
        // mountpoint lets the next pass skip the mount.
        self.refresh_capacity(cancel, drive).await?;
        progress.mounted = true;
        Ok(())
    }

    async fn refresh_capacity(
        &self,
        cancel: &CancellationToken,
        drive: &mut DriveObject,
    ) -> Result<(), DriveError> {
        let mountpoint = PathBuf::from(&drive.status.mountpoint);
        let free = cancellable(cancel, self.statter.free_capacity(&mountpoint))
            .await
            .map_err(|e| device_error("stat", drive.name(), e))?;
        drive.status.free_capacity = free;
        drive.status.allocated_capacity = drive.status.total_capacity.saturating_sub(free);
        Ok(())
    }

    /// Keeps the drive's UUID unless another drive on the same node already
    /// carries it, in which case a fresh one is generated.
    async fn resolve_filesystem_uuid(&self, drive: &DriveObject) -> Result<String, DriveError> {
        let current = &drive.status.filesystem_uuid;
        if current.is_empty() {
            return Ok(Uuid::new_v4().to_string());
        }

        let duplicate = self
            .repository
            .list_by_node(drive.node_name())
            .await?
            .iter()
            .any(|other| other.name() != drive.name() && other.status.filesystem_uuid == *current);

        if duplicate {
            let fresh = Uuid::new_v4().to_string();
            warn!(
                drive = %drive.name(),
                duplicate = %current,
                uuid = %fresh,
                "filesystem uuid already used on this node, generated a new one"
            );
            Ok(fresh)
        } else {
            Ok(current.clone())
        }
    }

    async fn delete(&self, cancel: &CancellationToken, mut drive: DriveObject) -> Result<(), DriveError> {
        debug!(drive = %drive.name(), node = %self.node_id, "drive delete called");

        if drive.status.drive_status != DriveStatus::Terminating {
            drive.status.drive_status = DriveStatus::Terminating;
            drive = match cancellable(cancel, self.repository.update(&drive)).await {
                Ok(updated) => updated,
                Err(DriveError::NotFound(_)) => {
                    debug!(drive = %drive.name(), "drive already removed");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
        }

        match drive.metadata.finalizers.as_slice() {
            [] => return Ok(()),
            [finalizer] if finalizer == DATA_PROTECTION_FINALIZER => {}
            [finalizer] => {
                return Err(DriveError::InvalidFinalizer {
                    drive: drive.name().to_string(),
                    finalizer: finalizer.clone(),
                })
            }
            _ => return Err(DriveError::DriveInUse(drive.name().to_string())),
        }

        let mountpoint = self.canonical_mountpoint(&drive);
        cancellable(cancel, self.mounter.unmount_drive(&mountpoint))
            .await
            .map_err(|e| device_error("unmount", drive.name(), e))?;

        drive.metadata.finalizers.clear();
        drive.status.mountpoint.clear();
        drive.status.mount_options.clear();
        match cancellable(cancel, self.repository.update(&drive)).await {
            Ok(_) | Err(DriveError::NotFound(_)) => {
                info!(drive = %drive.name(), "drive released for deletion");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn canonical_mountpoint(&self, drive: &DriveObject) -> PathBuf {
        if drive.status.filesystem_uuid.is_empty() {
            self.layout.mount_path(drive.name())
        } else {
            self.layout.mount_path(&drive.status.filesystem_uuid)
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for DriveEventHandler {
    async fn handle(
        &self,
        cancel: &CancellationToken,
        kind: EventKind,
        drive: DriveObject,
    ) -> Result<(), DriveError> {
        match kind {
            EventKind::Add | EventKind::Update => self.update(cancel, drive).await,
            EventKind::Delete => self.delete(cancel, drive).await,
        }
    }
}

async fn cancellable<T, F>(cancel: &CancellationToken, operation: F) -> Result<T, DriveError>
where
    F: Future<Output = Result<T, DriveError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DriveError::Cancelled),
        result = operation => result,
    }
}

fn device_error(op: &'static str, drive: &str, err: DriveError) -> DriveError {
    match err {
        DriveError::Cancelled | DriveError::Device { .. } => err,
        other => DriveError::device(op, drive, other),
    }
}
