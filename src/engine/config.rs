// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Configuration of a DeviceSet, assembled from "key=value" option strings.

use std::{fmt, path::PathBuf};

use devicemapper::Sectors;

use crate::{
    engine::cmd::join_mount_options,
    errors::{ErrorEnum, ThinsetError, ThinsetResult},
};

pub const DEFAULT_BASE_FS_SIZE: u64 = 10 * 1024 * 1024 * 1024;
pub const DEFAULT_DATA_LOOPBACK_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_META_LOOPBACK_SIZE: u64 = 2 * 1024 * 1024 * 1024;
/// 64 KiB thin-pool block size, expressed in 512-byte sectors.
pub const DEFAULT_THIN_BLOCK_SIZE: Sectors = Sectors(128);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Ext4,
    Xfs,
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FilesystemKind::Ext4 => write!(f, "ext4"),
            FilesystemKind::Xfs => write!(f, "xfs"),
        }
    }
}

/// All recognized options of a DeviceSet.
///
/// `blkdiscard` defaults to true only for loopback-backed pools; discarding
/// is expensive on raw hardware and pointless for an externally owned pool.
#[derive(Debug, Clone)]
pub struct DeviceSetConfig {
    /// Provisioned byte capacity of every new volume.
    pub base_fs_size: u64,
    /// Size of the sparse data file when loopback-backed.
    pub data_loopback_size: u64,
    /// Size of the sparse metadata file when loopback-backed.
    pub meta_loopback_size: u64,
    pub filesystem: FilesystemKind,
    /// Extra arguments appended to every mkfs invocation.
    pub mkfs_args: Vec<String>,
    /// Comma-joined option string appended to every mount.
    pub mount_options: String,
    /// Raw block device backing the data area instead of a loopback file.
    pub data_device: Option<PathBuf>,
    /// Raw block device backing the metadata area instead of a loopback file.
    pub metadata_device: Option<PathBuf>,
    /// Externally managed thin-pool, bypassing pool creation. Stored
    /// without the "/dev/mapper/" prefix.
    pub thin_pool_device: Option<String>,
    pub do_blk_discard: bool,
    /// Thin-pool block size in 512-byte sectors.
    pub thin_block_size: Sectors,
}

impl Default for DeviceSetConfig {
    fn default() -> DeviceSetConfig {
        DeviceSetConfig {
            base_fs_size: DEFAULT_BASE_FS_SIZE,
            data_loopback_size: DEFAULT_DATA_LOOPBACK_SIZE,
            meta_loopback_size: DEFAULT_META_LOOPBACK_SIZE,
            filesystem: FilesystemKind::Ext4,
            mkfs_args: Vec::new(),
            mount_options: String::new(),
            data_device: None,
            metadata_device: None,
            thin_pool_device: None,
            do_blk_discard: true,
            thin_block_size: DEFAULT_THIN_BLOCK_SIZE,
        }
    }
}

impl DeviceSetConfig {
    /// Build a config from "key=value" option strings. Unknown keys and
    /// malformed values fail.
    pub fn parse(options: &[String]) -> ThinsetResult<DeviceSetConfig> {
        let mut config = DeviceSetConfig::default();
        let mut found_blk_discard = false;

        for option in options {
            let (key, val) = split_option(option)?;
            match key.as_str() {
                "basesize" => config.base_fs_size = parse_size(val)?,
                "loopdatasize" => config.data_loopback_size = parse_size(val)?,
                "loopmetadatasize" => config.meta_loopback_size = parse_size(val)?,
                "fs" => {
                    config.filesystem = match val {
                        "ext4" => FilesystemKind::Ext4,
                        "xfs" => FilesystemKind::Xfs,
                        _ => {
                            return Err(ThinsetError::Engine(
                                ErrorEnum::Invalid,
                                format!("Unsupported filesystem {}", val),
                            ));
                        }
                    }
                }
                "mkfsarg" => config.mkfs_args.push(val.to_owned()),
                "mountopt" => {
                    config.mount_options = join_mount_options(&config.mount_options, val)
                }
                "metadatadev" => config.metadata_device = Some(PathBuf::from(val)),
                "datadev" => config.data_device = Some(PathBuf::from(val)),
                "thinpooldev" => {
                    let name = val.trim_start_matches("/dev/mapper/");
                    config.thin_pool_device = Some(name.to_owned());
                }
                "blkdiscard" => {
                    found_blk_discard = true;
                    config.do_blk_discard = val.parse::<bool>().map_err(|_| {
                        ThinsetError::Engine(
                            ErrorEnum::Invalid,
                            format!("Failed to parse bool from \"{}\"", val),
                        )
                    })?;
                }
                "blocksize" => {
                    // Converted to 512-byte sectors.
                    config.thin_block_size = Sectors(parse_size(val)? >> 9);
                }
                _ => {
                    return Err(ThinsetError::Engine(
                        ErrorEnum::Invalid,
                        format!("Unknown option {}", key),
                    ));
                }
            }
        }

        if !found_blk_discard
            && (config.data_device.is_some() || config.thin_pool_device.is_some())
        {
            config.do_blk_discard = false;
        }

        Ok(config)
    }
}

fn split_option(option: &str) -> ThinsetResult<(String, &str)> {
    let mut parts = option.splitn(2, '=');
    match (parts.next(), parts.next()) {
        (Some(key), Some(val)) if !key.is_empty() => Ok((key.to_lowercase(), val)),
        _ => Err(ThinsetError::Engine(
            ErrorEnum::Invalid,
            format!("Unable to parse key/value option: {}", option),
        )),
    }
}

/// Parse a byte count with an optional binary-multiple suffix, e.g. "512",
/// "64k", "10G".
pub fn parse_size(val: &str) -> ThinsetResult<u64> {
    let val = val.trim();
    let digits = val
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| val.len());
    let (num, suffix) = val.split_at(digits);

    let num = num.parse::<u64>().map_err(|_| {
        ThinsetError::Engine(
            ErrorEnum::Invalid,
            format!("Failed to parse size from \"{}\"", val),
        )
    })?;

    let shift = match suffix.trim().to_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        "t" | "tb" | "tib" => 40,
        _ => {
            return Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!("Unknown size suffix in \"{}\"", val),
            ));
        }
    };

    num.checked_shl(shift).ok_or_else(|| {
        ThinsetError::Engine(
            ErrorEnum::Invalid,
            format!("Size \"{}\" overflows a byte count", val),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(options: &[&str]) -> Vec<String> {
        options.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_size("100G").unwrap(), DEFAULT_DATA_LOOPBACK_SIZE);
        assert_eq!(parse_size("2GB").unwrap(), DEFAULT_META_LOOPBACK_SIZE);
        assert!(parse_size("").is_err());
        assert!(parse_size("10x").is_err());
        assert!(parse_size("-1").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = DeviceSetConfig::parse(&[]).unwrap();
        assert_eq!(config.base_fs_size, DEFAULT_BASE_FS_SIZE);
        assert_eq!(config.data_loopback_size, DEFAULT_DATA_LOOPBACK_SIZE);
        assert_eq!(config.meta_loopback_size, DEFAULT_META_LOOPBACK_SIZE);
        assert_eq!(config.filesystem, FilesystemKind::Ext4);
        assert_eq!(config.thin_block_size, DEFAULT_THIN_BLOCK_SIZE);
        assert!(config.do_blk_discard);
    }

    #[test]
    fn test_unknown_key_fails() {
        assert!(DeviceSetConfig::parse(&opts(&["nosuchkey=1"])).is_err());
        assert!(DeviceSetConfig::parse(&opts(&["basesize"])).is_err());
    }

    #[test]
    fn test_blocksize_to_sectors() {
        let config = DeviceSetConfig::parse(&opts(&["blocksize=64k"])).unwrap();
        assert_eq!(config.thin_block_size, Sectors(128));
    }

    #[test]
    fn test_thinpooldev_prefix_stripped() {
        let config =
            DeviceSetConfig::parse(&opts(&["thinpooldev=/dev/mapper/extpool"])).unwrap();
        assert_eq!(config.thin_pool_device.as_deref(), Some("extpool"));
    }

    #[test]
    fn test_blkdiscard_defaulting() {
        // Raw data device turns the discard hack off unless explicitly set.
        let config = DeviceSetConfig::parse(&opts(&["datadev=/dev/sdb"])).unwrap();
        assert!(!config.do_blk_discard);

        let config =
            DeviceSetConfig::parse(&opts(&["datadev=/dev/sdb", "blkdiscard=true"])).unwrap();
        assert!(config.do_blk_discard);

        let config = DeviceSetConfig::parse(&opts(&["thinpooldev=pool"])).unwrap();
        assert!(!config.do_blk_discard);
    }

    #[test]
    fn test_mountopt_joined() {
        let config =
            DeviceSetConfig::parse(&opts(&["mountopt=noatime", "mountopt=barrier=0"])).unwrap();
        assert_eq!(config.mount_options, "noatime,barrier=0");
    }

    #[test]
    fn test_unsupported_fs() {
        assert!(DeviceSetConfig::parse(&opts(&["fs=btrfs"])).is_err());
    }
}
