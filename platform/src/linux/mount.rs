use super::{blocking, errno_error};
use drivekeeper_core::{DriveError, DriveMounter, FILESYSTEM_XFS};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PROC_MOUNTS: &str = "/proc/mounts";

pub struct LinuxDriveMounter;

/// Splits mount options into kernel flags and filesystem-specific data.
pub fn parse_mount_options(options: &[String]) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();

    for option in options.iter().map(|o| o.trim()).filter(|o| !o.is_empty()) {
        match option {
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" => flags &= !MsFlags::MS_RDONLY,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "strictatime" => flags |= MsFlags::MS_STRICTATIME,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            "defaults" => {}
            other => data.push(other.to_string()),
        }
    }

    let data = if data.is_empty() {
        None
    } else {
        Some(data.join(","))
    };
    (flags, data)
}

/// Mount targets listed in a `/proc/mounts`-formatted table. Octal escapes
/// (`\040` for space) are decoded.
pub fn mount_targets(table: &str) -> Vec<PathBuf> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|target| PathBuf::from(unescape_mount_field(target)))
        .collect()
}

fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let octal = i + 3 < bytes.len()
            && bytes[i] == b'\\'
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if octal {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            out.push(value as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_mounted(target: &Path) -> Result<bool, DriveError> {
    let table = fs::read_to_string(PROC_MOUNTS)?;
    Ok(mount_targets(&table).iter().any(|t| t == target))
}

#[async_trait::async_trait]
impl DriveMounter for LinuxDriveMounter {
    async fn mount_drive(&self, source: &Path, target: &Path, options: &[String]) -> Result<(), DriveError> {
        let source = source.to_path_buf();
        let target = target.to_path_buf();
        let (flags, data) = parse_mount_options(options);

        blocking(move || {
            fs::create_dir_all(&target)?;
            if is_mounted(&target)? {
                debug!(target = %target.display(), "drive already mounted");
                return Ok(());
            }

            info!(
                source = %source.display(),
                target = %target.display(),
                "mounting drive"
            );
            mount(
                Some(source.as_path()),
                target.as_path(),
                Some(FILESYSTEM_XFS),
                flags,
                data.as_deref(),
            )
            .map_err(|errno| errno_error(&format!("mount {} on {}", source.display(), target.display()), errno))
        })
        .await
    }

    async fn unmount_drive(&self, target: &Path) -> Result<(), DriveError> {
        let target = target.to_path_buf();
        blocking(move || match umount2(target.as_path(), MntFlags::empty()) {
            Ok(()) => {
                info!(target = %target.display(), "unmounted drive");
                Ok(())
            }
            Err(Errno::EINVAL) | Err(Errno::ENOENT) => {
                debug!(target = %target.display(), "drive not mounted");
                Ok(())
            }
            Err(errno) => Err(errno_error(&format!("umount {}", target.display()), errno)),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(options: &[&str]) -> Vec<String> {
        options.iter().map(|o| o.to_string()).collect()
    }

    #[test]
    fn test_parse_mount_options_flags_and_data() {
        let (flags, data) = parse_mount_options(&opts(&["noatime", "nodev", "prjquota", "logbsize=256k"]));
        assert!(flags.contains(MsFlags::MS_NOATIME));
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert_eq!(data.as_deref(), Some("prjquota,logbsize=256k"));
    }

    #[test]
    fn test_parse_mount_options_empty() {
        let (flags, data) = parse_mount_options(&opts(&["", "defaults"]));
        assert!(flags.is_empty());
        assert!(data.is_none());
    }

    #[test]
    fn test_rw_clears_ro() {
        let (flags, _) = parse_mount_options(&opts(&["ro", "rw"]));
        assert!(!flags.contains(MsFlags::MS_RDONLY));
    }

    #[test]
    fn test_mount_targets_parses_proc_mounts() {
        let table = "\
/dev/sda1 / ext4 rw,relatime 0 0
/dev/directcsi-abc /var/lib/direct-csi/mnt/abc xfs rw,noatime 0 0
/dev/sdb1 /mnt/with\\040space vfat rw 0 0
";
        let targets = mount_targets(table);
        assert_eq!(targets.len(), 3);
        assert!(targets.contains(&PathBuf::from("/var/lib/direct-csi/mnt/abc")));
        assert!(targets.contains(&PathBuf::from("/mnt/with space")));
    }
}
