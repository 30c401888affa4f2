use super::{blocking, errno_error};
use drivekeeper_core::{DriveError, DriveFormatter};
use nix::errno::Errno;
use nix::sys::stat::{makedev, mknod, stat, Mode, SFlag};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info, warn};

const MKFS_XFS: &str = "mkfs.xfs";
const FILESYSTEM_LABEL: &str = "DIRECTCSI";

pub struct LinuxDriveFormatter;

impl LinuxDriveFormatter {
    /// Arguments passed to `mkfs.xfs` for a drive.
    pub fn mkfs_args(uuid: &str, source: &Path, force: bool) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            "maxpct=50".to_string(),
            "-m".to_string(),
            format!("uuid={}", uuid),
        ];
        if force {
            args.push("-f".to_string());
        }
        args.push("-L".to_string());
        args.push(FILESYSTEM_LABEL.to_string());
        args.push(source.to_string_lossy().into_owned());
        args
    }

    fn ensure_block_file(path: &Path, major: u32, minor: u32) -> Result<(), DriveError> {
        let dev = makedev(major as u64, minor as u64);

        match stat(path) {
            Ok(existing) => {
                let is_block = SFlag::from_bits_truncate(existing.st_mode) & SFlag::S_IFMT == SFlag::S_IFBLK;
                if is_block && existing.st_rdev == dev {
                    debug!(path = %path.display(), "block file already exists");
                    return Ok(());
                }
                warn!(
                    path = %path.display(),
                    major,
                    minor,
                    "replacing stale file at block file path"
                );
                fs::remove_file(path)?;
            }
            Err(Errno::ENOENT) => {}
            Err(errno) => return Err(errno_error(&format!("stat {}", path.display()), errno)),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match mknod(path, SFlag::S_IFBLK, Mode::from_bits_truncate(0o600), dev) {
            Ok(()) | Err(Errno::EEXIST) => Ok(()),
            Err(errno) => Err(errno_error(&format!("mknod {}", path.display()), errno)),
        }
    }
}

#[async_trait::async_trait]
impl DriveFormatter for LinuxDriveFormatter {
    async fn make_block_file(&self, path: &Path, major: u32, minor: u32) -> Result<(), DriveError> {
        let path = PathBuf::from(path);
        blocking(move || Self::ensure_block_file(&path, major, minor)).await
    }

    async fn format_drive(&self, uuid: &str, source: &Path, force: bool) -> Result<(), DriveError> {
        let mkfs = which::which(MKFS_XFS)
            .map_err(|_| DriveError::ExternalToolMissing(MKFS_XFS.to_string()))?;

        info!(source = %source.display(), uuid, force, "formatting drive with xfs");
        let output = run_tool(&mkfs, &Self::mkfs_args(uuid, source, force)).await?;
        if !output.status.success() {
            return Err(mkfs_failure(source, &output.status.to_string(), &output.stderr));
        }
        Ok(())
    }
}

/// Runs an external tool to completion. Dropping the future kills the child.
async fn run_tool(program: &Path, args: &[String]) -> Result<Output, DriveError> {
    Ok(Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await?)
}

fn mkfs_failure(source: &Path, status: &str, stderr: &[u8]) -> DriveError {
    let stderr = String::from_utf8_lossy(stderr);
    DriveError::device(
        "format",
        source.to_string_lossy(),
        format!("{} exited with {}: {}", MKFS_XFS, status, stderr.trim()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mkfs_args() {
        let args = LinuxDriveFormatter::mkfs_args("abc", Path::new("/dev/directcsi-abc"), false);
        assert_eq!(
            args,
            vec!["-i", "maxpct=50", "-m", "uuid=abc", "-L", "DIRECTCSI", "/dev/directcsi-abc"]
        );

        let forced = LinuxDriveFormatter::mkfs_args("abc", Path::new("/dev/directcsi-abc"), true);
        assert!(forced.contains(&"-f".to_string()));
        assert_eq!(forced.last().map(String::as_str), Some("/dev/directcsi-abc"));
    }

    #[test]
    fn test_mkfs_failure_is_a_format_error() {
        let err = mkfs_failure(
            Path::new("/dev/directcsi-abc"),
            "exit status: 1",
            b"mkfs.xfs: /dev/directcsi-abc contains a mounted filesystem\n",
        );
        assert!(matches!(err, DriveError::Device { op: "format", .. }));
        assert_eq!(
            err.to_string(),
            "Failed to format drive /dev/directcsi-abc: mkfs.xfs exited with exit status: 1: \
             mkfs.xfs: /dev/directcsi-abc contains a mounted filesystem"
        );
    }

    #[tokio::test]
    async fn test_dropped_tool_run_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 0.3; touch {}", marker.display());
        let args = vec!["-c".to_string(), script];

        let run = run_tool(Path::new("/bin/sh"), &args);
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(50), run).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert!(!marker.exists(), "child outlived its dropped future");
    }
}
