// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The kernel collaborator interface. Everything the device set asks of the
// device-mapper subsystem, including loopback attachment which belongs to
// the same layer, goes through this trait; the kernel-facing implementation
// lives in dm_linux, tests substitute the in-memory model in sim.

use std::path::{Path, PathBuf};

use devicemapper::{Sectors, ThinDevId};

use crate::errors::ThinsetResult;

/// Kernel-side state of one device-mapper device.
#[derive(Debug, Clone, Copy)]
pub struct DmDeviceState {
    /// Number of open references the kernel holds on the device node.
    pub open_count: i32,
}

/// One line of a device's status table.
#[derive(Debug, Clone)]
pub struct DmStatusLine {
    pub length: Sectors,
    pub target_type: String,
    pub params: String,
}

/// Operations on the kernel device-mapper collaborator.
///
/// The library underneath is not thread-safe; the device set owns the one
/// handle behind its global mutex and every call borrows it from there.
/// Implementations report "no such device" as `Ok(None)` from
/// [`device_info`](DmApi::device_info) and reserve errors for failures that
/// say nothing about existence.
pub trait DmApi: Send + Sync {
    /// Version triple of the device-mapper driver. Failing here means the
    /// kernel cannot support the device set at all.
    fn driver_version(&self) -> ThinsetResult<(u32, u32, u32)>;

    /// Whether device node creation is synchronized with udev.
    fn udev_sync_supported(&self) -> bool;

    fn device_info(&self, name: &str) -> ThinsetResult<Option<DmDeviceState>>;

    /// Create and activate a thin-pool over the given data and metadata
    /// block devices.
    fn create_pool(
        &self,
        name: &str,
        data: &Path,
        metadata: &Path,
        block_size: Sectors,
    ) -> ThinsetResult<()>;

    /// Load a fresh pool table reflecting the current size of the data
    /// device. The caller brackets this with suspend and resume.
    fn reload_pool(
        &self,
        name: &str,
        data: &Path,
        metadata: &Path,
        block_size: Sectors,
    ) -> ThinsetResult<()>;

    fn suspend_device(&self, name: &str) -> ThinsetResult<()>;

    fn resume_device(&self, name: &str) -> ThinsetResult<()>;

    /// Remove the device from the kernel's table. May fail with
    /// `ErrorEnum::Busy` while the device has open references.
    fn remove_device(&self, name: &str) -> ThinsetResult<()>;

    /// Provision a new thin device in the pool. Fails with
    /// `ErrorEnum::DeviceIdExists` if the pool already holds the id.
    fn create_thin(&self, pool_name: &str, id: ThinDevId) -> ThinsetResult<()>;

    /// Provision a snapshot of the origin thin device. The origin need not
    /// be active; if it is, it is suspended around the operation.
    fn create_snap(
        &self,
        pool_name: &str,
        id: ThinDevId,
        origin_name: &str,
        origin_id: ThinDevId,
    ) -> ThinsetResult<()>;

    fn delete_thin(&self, pool_name: &str, id: ThinDevId) -> ThinsetResult<()>;

    /// Advance the pool's transaction id, atomically in the kernel.
    /// Fails if `old` no longer matches the pool's current id.
    fn set_transaction_id(&self, pool_name: &str, old: u64, new: u64) -> ThinsetResult<()>;

    /// Activate a provisioned thin device under the given name with the
    /// given byte capacity.
    fn activate_thin(
        &self,
        pool_name: &str,
        name: &str,
        id: ThinDevId,
        size: u64,
    ) -> ThinsetResult<()>;

    /// The single status line of a pool or thin device.
    fn device_status(&self, name: &str) -> ThinsetResult<DmStatusLine>;

    /// Discard all blocks of the device. Used as a workaround for the
    /// kernel not returning thin-pool space when a device is deleted.
    fn block_discard(&self, devnode: &Path) -> ThinsetResult<()>;

    /// Attach a regular file as a loopback block device; returns the
    /// device node.
    fn attach_loop(&self, backing: &Path) -> ThinsetResult<PathBuf>;

    /// Tell the loop driver to re-read the size of the backing file.
    fn loop_set_capacity(&self, backing: &Path) -> ThinsetResult<()>;
}
