// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The kernel-facing DmApi implementation, driving the devicemapper crate's
// ioctl context plus the loop driver.

use std::{
    error::Error,
    fs::{read_dir, read_to_string, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use nix::{
    ioctl_read, ioctl_write_ptr_bad, request_code_none,
    sys::stat::{major, minor, stat},
};

use devicemapper::{DevId, DmError, DmFlags, DmName, DmOptions, Sectors, ThinDevId, DM};

use loopdev::{LoopControl, LoopDevice};

use crate::{
    engine::dm::{DmApi, DmDeviceState, DmStatusLine},
    errors::{ErrorEnum, ThinsetError, ThinsetResult},
};

ioctl_read!(blkgetsize64, 0x12, 114, u64);
ioctl_write_ptr_bad!(blkdiscard, request_code_none!(0x12, 119), [u64; 2]);

/// Low water mark passed in the pool table, in data blocks.
const POOL_LOW_WATER_MARK: u64 = 32768;

/// The devicemapper context for one process.
pub struct LinuxDm {
    dm: DM,
}

impl LinuxDm {
    pub fn new() -> ThinsetResult<LinuxDm> {
        Ok(LinuxDm { dm: DM::new()? })
    }

    /// The "major:minor" device string for a block device node.
    fn dstr(node: &Path) -> ThinsetResult<String> {
        let st = stat(node)?;
        Ok(format!("{}:{}", major(st.st_rdev), minor(st.st_rdev)))
    }

    /// Size in bytes of a block device, via BLKGETSIZE64.
    fn blkdev_size(node: &Path) -> ThinsetResult<u64> {
        let file = OpenOptions::new().read(true).open(node)?;
        let mut size = 0u64;
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(ThinsetError::Nix)?;
        Ok(size)
    }

    /// The one table line of a thin-pool over the given backing devices.
    fn pool_table(
        data: &Path,
        metadata: &Path,
        block_size: Sectors,
    ) -> ThinsetResult<Vec<(u64, u64, String, String)>> {
        let length = Self::blkdev_size(data)? >> 9;
        let params = format!(
            "{} {} {} {} 1 skip_block_zeroing",
            Self::dstr(metadata)?,
            Self::dstr(data)?,
            *block_size,
            POOL_LOW_WATER_MARK
        );
        Ok(vec![(0u64, length, "thin-pool".to_owned(), params)])
    }

    /// Create a device, load its table, and resume it. The half-created
    /// device is removed again if the table does not load.
    fn activate(&self, name: &str, table: &[(u64, u64, String, String)]) -> ThinsetResult<()> {
        let name = DmName::new(name)?;
        let id = DevId::Name(name);
        self.dm.device_create(name, None, DmOptions::default())?;
        if let Err(err) = self.dm.table_load(&id, table, DmOptions::default()) {
            if let Err(err) = self.dm.device_remove(&id, DmOptions::default()) {
                warn!("Unable to remove device after failed table load: {}", err);
            }
            return Err(err.into());
        }
        self.dm.device_suspend(&id, DmOptions::default())?;
        Ok(())
    }

    fn message(&self, pool_name: &str, msg: &str) -> Result<(), DmError> {
        let name = DmName::new(pool_name)?;
        self.dm.target_msg(&DevId::Name(name), None, msg)?;
        Ok(())
    }
}

/// The errno buried in a devicemapper error, if any.
fn dm_errno(err: &DmError) -> Option<i32> {
    let mut source: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            return io_err.raw_os_error();
        }
        source = inner.source();
    }
    None
}

/// EBUSY means the kernel may release the device shortly; the wait
/// utilities retry on it.
fn classify_busy(err: DmError) -> ThinsetError {
    if dm_errno(&err) == Some(libc::EBUSY) {
        ThinsetError::Engine(ErrorEnum::Busy, format!("Device busy: {}", err))
    } else {
        err.into()
    }
}

/// EEXIST from a create message means the pool already holds the thin id.
fn classify_id_exists(err: DmError) -> ThinsetError {
    if dm_errno(&err) == Some(libc::EEXIST) {
        ThinsetError::Engine(
            ErrorEnum::DeviceIdExists,
            format!("Device id already exists in pool: {}", err),
        )
    } else {
        err.into()
    }
}

impl DmApi for LinuxDm {
    fn driver_version(&self) -> ThinsetResult<(u32, u32, u32)> {
        Ok(self.dm.version()?)
    }

    fn udev_sync_supported(&self) -> bool {
        // Node creation can only be synchronized when udev is running.
        Path::new("/run/udev/control").exists()
    }

    fn device_info(&self, name: &str) -> ThinsetResult<Option<DmDeviceState>> {
        let name = DmName::new(name)?;
        match self.dm.device_info(&DevId::Name(name)) {
            Ok(info) => Ok(Some(DmDeviceState {
                open_count: info.open_count(),
            })),
            // ENXIO-class failures mean the name is not in the kernel's
            // table; anything else is a real error.
            Err(err) => match dm_errno(&err) {
                Some(libc::ENXIO) | Some(libc::ENODEV) | Some(libc::ENOENT) => Ok(None),
                _ => Err(err.into()),
            },
        }
    }

    fn create_pool(
        &self,
        name: &str,
        data: &Path,
        metadata: &Path,
        block_size: Sectors,
    ) -> ThinsetResult<()> {
        let table = Self::pool_table(data, metadata, block_size)?;
        self.activate(name, &table)
    }

    fn reload_pool(
        &self,
        name: &str,
        data: &Path,
        metadata: &Path,
        block_size: Sectors,
    ) -> ThinsetResult<()> {
        let table = Self::pool_table(data, metadata, block_size)?;
        let name = DmName::new(name)?;
        self.dm
            .table_load(&DevId::Name(name), &table, DmOptions::default())?;
        Ok(())
    }

    fn suspend_device(&self, name: &str) -> ThinsetResult<()> {
        let name = DmName::new(name)?;
        self.dm.device_suspend(
            &DevId::Name(name),
            DmOptions::default().set_flags(DmFlags::DM_SUSPEND),
        )?;
        Ok(())
    }

    fn resume_device(&self, name: &str) -> ThinsetResult<()> {
        let name = DmName::new(name)?;
        self.dm
            .device_suspend(&DevId::Name(name), DmOptions::default())?;
        Ok(())
    }

    fn remove_device(&self, name: &str) -> ThinsetResult<()> {
        let name = DmName::new(name)?;
        self.dm
            .device_remove(&DevId::Name(name), DmOptions::default())
            .map_err(classify_busy)?;
        Ok(())
    }

    fn create_thin(&self, pool_name: &str, id: ThinDevId) -> ThinsetResult<()> {
        self.message(pool_name, &format!("create_thin {}", id))
            .map_err(classify_id_exists)
    }

    fn create_snap(
        &self,
        pool_name: &str,
        id: ThinDevId,
        origin_name: &str,
        origin_id: ThinDevId,
    ) -> ThinsetResult<()> {
        // An active origin must be suspended while the snapshot is taken;
        // an inactive one needs nothing.
        let suspended = if self.device_info(origin_name)?.is_some() {
            self.suspend_device(origin_name)?;
            true
        } else {
            false
        };

        let result = self
            .message(pool_name, &format!("create_snap {} {}", id, origin_id))
            .map_err(classify_id_exists);

        if suspended {
            self.resume_device(origin_name)?;
        }
        result
    }

    fn delete_thin(&self, pool_name: &str, id: ThinDevId) -> ThinsetResult<()> {
        self.message(pool_name, &format!("delete {}", id))?;
        Ok(())
    }

    fn set_transaction_id(&self, pool_name: &str, old: u64, new: u64) -> ThinsetResult<()> {
        self.message(pool_name, &format!("set_transaction_id {} {}", old, new))?;
        Ok(())
    }

    fn activate_thin(
        &self,
        pool_name: &str,
        name: &str,
        id: ThinDevId,
        size: u64,
    ) -> ThinsetResult<()> {
        let pool = DmName::new(pool_name)?;
        let pool_device = self.dm.device_info(&DevId::Name(pool))?.device();
        let params = format!("{} {}", pool_device, id);
        let table = vec![(0u64, size >> 9, "thin".to_owned(), params)];
        self.activate(name, &table)
    }

    fn device_status(&self, name: &str) -> ThinsetResult<DmStatusLine> {
        let name = DmName::new(name)?;
        let (_, mut lines) = self
            .dm
            .table_status(&DevId::Name(name), DmOptions::default())?;
        match lines.pop() {
            Some((_, length, target_type, params)) => Ok(DmStatusLine {
                length: Sectors(length),
                target_type,
                params,
            }),
            None => Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!("Device {} has an empty status table", name),
            )),
        }
    }

    fn block_discard(&self, devnode: &Path) -> ThinsetResult<()> {
        let file = OpenOptions::new().read(true).write(true).open(devnode)?;
        let mut size = 0u64;
        unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(ThinsetError::Nix)?;
        let range = [0u64, size];
        unsafe { blkdiscard(file.as_raw_fd(), &range) }.map_err(ThinsetError::Nix)?;
        file.sync_all()?;
        Ok(())
    }

    fn attach_loop(&self, backing: &Path) -> ThinsetResult<PathBuf> {
        let control = LoopControl::open()?;
        let device = control.next_free()?;
        device.attach_file(backing)?;
        device.path().ok_or_else(|| {
            ThinsetError::Engine(
                ErrorEnum::Error,
                format!("No device node for loop device backed by {:?}", backing),
            )
        })
    }

    fn loop_set_capacity(&self, backing: &Path) -> ThinsetResult<()> {
        let node = find_loop_device(backing)?.ok_or_else(|| {
            ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!("Unable to find loopback mount for {:?}", backing),
            )
        })?;
        let device = LoopDevice::open(&node)?;
        device.set_capacity()?;
        Ok(())
    }
}

/// Locate the loop device attached to a backing file by scanning the loop
/// driver's sysfs entries.
fn find_loop_device(backing: &Path) -> ThinsetResult<Option<PathBuf>> {
    let backing = backing.canonicalize()?;
    for entry in read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("loop") {
            continue;
        }
        let backing_file = entry.path().join("loop").join("backing_file");
        let found = match read_to_string(&backing_file) {
            Ok(found) => found,
            Err(_) => continue,
        };
        if Path::new(found.trim_end()) == backing {
            return Ok(Some(PathBuf::from(format!("/dev/{}", name))));
        }
    }
    Ok(None)
}
