// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Functions for dealing with device-mapper names used by the device set.

use std::path::{Path, PathBuf};

use nix::sys::stat::{major, minor, stat};

use crate::errors::ThinsetResult;

/// The file name a device record is stored under; the base device has the
/// empty hash.
pub fn record_name(hash: &str) -> &str {
    if hash.is_empty() {
        "base"
    } else {
        hash
    }
}

/// Derive the kernel-name prefix for a root directory from its (device
/// major, device minor, inode) triple, so independent roots never collide
/// in the device-mapper namespace.
///
/// `thinset-<maj>:<min>-<ino>` stands for: managed by thinset, rooted on
/// the filesystem at major `<maj>`, minor `<min>`, in the directory with
/// inode `<ino>`.
pub fn device_prefix(root: &Path) -> ThinsetResult<String> {
    let st = stat(root)?;
    Ok(format!(
        "thinset-{}:{}-{}",
        major(st.st_dev),
        minor(st.st_dev),
        st.st_ino
    ))
}

/// The device-mapper name of the thin device for a hash.
pub fn device_name(prefix: &str, hash: &str) -> String {
    format!("{}-{}", prefix, record_name(hash))
}

/// The device-mapper name of the thin-pool.
pub fn pool_name(prefix: &str) -> String {
    format!("{}-pool", prefix)
}

/// The device node under /dev/mapper for a device-mapper name.
pub fn dev_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/dev/mapper/{}", name))
}
