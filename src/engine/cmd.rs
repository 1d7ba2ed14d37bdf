// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The filesystem-tools collaborator: formatting volumes with the external
// mkfs binaries, probing what is on a volume, and mounting it. This module
// assumes that, for a given machine, there is only one place where a
// desired executable might be installed; the absolute path is resolved
// once and the file's existence is re-checked before every invocation.

use std::{
    fs::OpenOptions,
    io::Read,
    path::{Path, PathBuf},
    process::Command,
};

use nix::mount::{mount, umount2, MntFlags, MsFlags};

use crate::{
    engine::config::FilesystemKind,
    errors::{ErrorEnum, ThinsetError, ThinsetResult},
};

/// Filesystem tooling and mount operations on behalf of the device set.
pub trait FsApi: Send + Sync {
    /// Format the device. Volumes cloned by snapshot inherit their
    /// parent's filesystem and never pass through here.
    fn create_filesystem(
        &self,
        kind: FilesystemKind,
        mkfs_args: &[String],
        devnode: &Path,
    ) -> ThinsetResult<()>;

    /// The filesystem type on the device, by superblock magic.
    fn probe_fs_type(&self, devnode: &Path) -> ThinsetResult<String>;

    fn mount(&self, devnode: &Path, target: &Path, fstype: &str, options: &str)
        -> ThinsetResult<()>;

    /// Lazily detach the mount so a still-busy tree leaves the namespace
    /// immediately and is released when its last user exits.
    fn unmount_detach(&self, target: &Path) -> ThinsetResult<()>;
}

/// Find the binary with the given name by looking in likely locations.
fn find_binary(name: &str) -> Option<PathBuf> {
    ["/usr/sbin", "/sbin", "/usr/bin", "/bin"]
        .iter()
        .map(|pre| [pre, name].iter().collect::<PathBuf>())
        .find(|path| path.exists())
}

lazy_static! {
    static ref MKFS_EXT4_BIN: Option<PathBuf> = find_binary("mkfs.ext4");
    static ref MKFS_XFS_BIN: Option<PathBuf> = find_binary("mkfs.xfs");
    static ref TUNE2FS_BIN: Option<PathBuf> = find_binary("tune2fs");
}

fn binary(found: &'static Option<PathBuf>, name: &str) -> ThinsetResult<&'static Path> {
    match found.as_ref() {
        Some(path) if path.exists() => Ok(path),
        _ => Err(ThinsetError::Engine(
            ErrorEnum::Error,
            format!("Executable {} not found", name),
        )),
    }
}

/// Run a command line utility, folding stdout and stderr into the error
/// message if it fails.
fn execute_cmd(cmd: &mut Command, error_msg: &str) -> ThinsetResult<()> {
    let result = cmd.output()?;
    if result.status.success() {
        Ok(())
    } else {
        let std_out_txt = String::from_utf8_lossy(&result.stdout);
        let std_err_txt = String::from_utf8_lossy(&result.stderr);
        let err_msg = format!(
            "{} stdout: {} stderr: {}",
            error_msg, std_out_txt, std_err_txt
        );
        Err(ThinsetError::Engine(ErrorEnum::Error, err_msg))
    }
}

/// Join mount option fragments with commas, tolerating empty fragments.
pub fn join_mount_options(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_owned()
    } else if b.is_empty() {
        a.to_owned()
    } else {
        format!("{},{}", a, b)
    }
}

#[derive(Debug, Default)]
pub struct LinuxFs;

impl LinuxFs {
    fn mkfs_ext4(extended: &str, mkfs_args: &[String], devnode: &Path) -> ThinsetResult<()> {
        execute_cmd(
            Command::new(binary(&MKFS_EXT4_BIN, "mkfs.ext4")?)
                .arg("-E")
                .arg(extended)
                .args(mkfs_args)
                .arg(devnode),
            &format!("Failed to create ext4 filesystem on {:?}", devnode),
        )
    }
}

impl FsApi for LinuxFs {
    fn create_filesystem(
        &self,
        kind: FilesystemKind,
        mkfs_args: &[String],
        devnode: &Path,
    ) -> ThinsetResult<()> {
        match kind {
            FilesystemKind::Xfs => execute_cmd(
                Command::new(binary(&MKFS_XFS_BIN, "mkfs.xfs")?)
                    .args(mkfs_args)
                    .arg(devnode),
                &format!("Failed to create xfs filesystem on {:?}", devnode),
            ),
            FilesystemKind::Ext4 => {
                // Older mke2fs releases do not know lazy_journal_init.
                Self::mkfs_ext4(
                    "nodiscard,lazy_itable_init=0,lazy_journal_init=0",
                    mkfs_args,
                    devnode,
                )
                .or_else(|_| {
                    Self::mkfs_ext4("nodiscard,lazy_itable_init=0", mkfs_args, devnode)
                })?;
                // Disable periodic checks; volumes are short-lived clones.
                execute_cmd(
                    Command::new(binary(&TUNE2FS_BIN, "tune2fs")?)
                        .args(&["-c", "-1", "-i", "0"])
                        .arg(devnode),
                    &format!("Failed to disable periodic checks on {:?}", devnode),
                )
            }
        }
    }

    fn probe_fs_type(&self, devnode: &Path) -> ThinsetResult<String> {
        probe_fs_type(devnode)
    }

    fn mount(
        &self,
        devnode: &Path,
        target: &Path,
        fstype: &str,
        options: &str,
    ) -> ThinsetResult<()> {
        let data = if options.is_empty() {
            None
        } else {
            Some(options)
        };
        mount(
            Some(devnode),
            target,
            Some(fstype),
            MsFlags::empty(),
            data,
        )
        .map_err(ThinsetError::Nix)
    }

    fn unmount_detach(&self, target: &Path) -> ThinsetResult<()> {
        umount2(target, MntFlags::MNT_DETACH).map_err(ThinsetError::Nix)
    }
}

/// Superblock magics of the supported filesystems: "XFSB" leads an XFS
/// volume; ext4 keeps 0xEF53 at offset 0x38 of the superblock, which
/// starts at byte 1024.
const EXT4_MAGIC_OFFSET: usize = 0x438;

fn probe_fs_type(devnode: &Path) -> ThinsetResult<String> {
    let mut buf = [0u8; EXT4_MAGIC_OFFSET + 2];
    let mut file = OpenOptions::new().read(true).open(devnode)?;
    file.read_exact(&mut buf)?;

    if &buf[0..4] == b"XFSB" {
        return Ok("xfs".to_owned());
    }
    if buf[EXT4_MAGIC_OFFSET] == 0x53 && buf[EXT4_MAGIC_OFFSET + 1] == 0xef {
        return Ok("ext4".to_owned());
    }

    Err(ThinsetError::Engine(
        ErrorEnum::Invalid,
        format!("Unknown filesystem type on {:?}", devnode),
    ))
}

#[cfg(test)]
mod tests {
    use std::{fs::write, io::Write};

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_join_mount_options() {
        assert_eq!(join_mount_options("", ""), "");
        assert_eq!(join_mount_options("nouuid", ""), "nouuid");
        assert_eq!(join_mount_options("", "discard"), "discard");
        assert_eq!(join_mount_options("nouuid", "discard"), "nouuid,discard");
    }

    #[test]
    fn test_probe_xfs() {
        let mut file = NamedTempFile::new().unwrap();
        let mut image = vec![0u8; 4096];
        image[0..4].copy_from_slice(b"XFSB");
        file.write_all(&image).unwrap();
        assert_eq!(probe_fs_type(file.path()).unwrap(), "xfs");
    }

    #[test]
    fn test_probe_ext4() {
        let file = NamedTempFile::new().unwrap();
        let mut image = vec![0u8; 4096];
        image[EXT4_MAGIC_OFFSET] = 0x53;
        image[EXT4_MAGIC_OFFSET + 1] = 0xef;
        write(file.path(), &image).unwrap();
        assert_eq!(probe_fs_type(file.path()).unwrap(), "ext4");
    }

    #[test]
    fn test_probe_unknown() {
        let file = NamedTempFile::new().unwrap();
        write(file.path(), vec![0u8; 4096]).unwrap();
        assert!(probe_fs_type(file.path()).is_err());
    }
}
