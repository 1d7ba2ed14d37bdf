// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// In-memory models of the kernel collaborator and the filesystem tools,
// with the failure semantics the device set depends on: id collisions on
// create messages, transaction-id fencing, busy removals. Handles are
// cheap clones over shared state, so a "restarted" device set can be
// pointed at the same simulated kernel.

use std::{
    collections::{HashMap, HashSet},
    fs::metadata,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use devicemapper::{Sectors, ThinDevId};

use crate::{
    engine::{
        cmd::FsApi,
        config::FilesystemKind,
        dm::{DmApi, DmDeviceState, DmStatusLine},
    },
    errors::{ErrorEnum, ThinsetError, ThinsetResult},
};

const META_BLOCK_SIZE: u64 = 4096;

#[derive(Debug)]
struct SimPool {
    transaction_id: u64,
    thin_ids: HashSet<u32>,
    length: Sectors,
    used_data_blocks: u64,
    total_data_blocks: u64,
    used_meta_blocks: u64,
    total_meta_blocks: u64,
}

#[derive(Debug)]
struct SimDevice {
    open_count: i32,
    length: Sectors,
}

#[derive(Debug, Default)]
struct SimState {
    /// Pool state survives device removal, like metadata on the backing
    /// device does.
    pools: HashMap<String, SimPool>,
    /// Devices the kernel currently has a table for.
    devices: HashMap<String, SimDevice>,
    loops: HashMap<PathBuf, PathBuf>,
    next_loop: u32,
    /// Names whose next removals report EBUSY, with a countdown.
    busy_removals: HashMap<String, u32>,
}

/// A simulated kernel device-mapper.
#[derive(Debug, Clone, Default)]
pub struct SimDm {
    state: Arc<Mutex<SimState>>,
}

impl SimDm {
    pub fn new() -> SimDm {
        SimDm::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().expect("only panics if a lock holder panicked")
    }

    /// Make the next `count` removals of `name` fail with EBUSY.
    pub fn inject_remove_busy(&self, name: &str, count: u32) {
        self.state().busy_removals.insert(name.to_owned(), count);
    }

    /// Pretend an externally managed pool is already active.
    pub fn add_external_pool(&self, name: &str, transaction_id: u64, used_data_blocks: u64) {
        let mut state = self.state();
        state.pools.insert(
            name.to_owned(),
            SimPool {
                transaction_id,
                thin_ids: HashSet::new(),
                length: Sectors(1 << 21),
                used_data_blocks,
                total_data_blocks: 1 << 14,
                used_meta_blocks: 0,
                total_meta_blocks: 1 << 9,
            },
        );
        state.devices.insert(
            name.to_owned(),
            SimDevice {
                open_count: 0,
                length: Sectors(1 << 21),
            },
        );
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.state().devices.contains_key(name)
    }

    pub fn set_open_count(&self, name: &str, open_count: i32) {
        if let Some(dev) = self.state().devices.get_mut(name) {
            dev.open_count = open_count;
        }
    }

    pub fn pool_transaction_id(&self, pool_name: &str) -> u64 {
        self.state()
            .pools
            .get(pool_name)
            .map(|pool| pool.transaction_id)
            .unwrap_or(0)
    }

    pub fn thin_ids(&self, pool_name: &str) -> Vec<u32> {
        let mut ids = self
            .state()
            .pools
            .get(pool_name)
            .map(|pool| pool.thin_ids.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }
}

impl SimState {
    /// A pool's backing paths arrive either as the backing file itself or
    /// as the node of a simulated loop attachment; sizes always come from
    /// the backing file.
    fn resolve_backing(&self, node: &Path) -> PathBuf {
        self.loops
            .iter()
            .find(|(_, n)| n.as_path() == node)
            .map(|(backing, _)| backing.clone())
            .unwrap_or_else(|| node.to_owned())
    }
}

fn no_such_device(name: &str) -> ThinsetError {
    ThinsetError::Engine(ErrorEnum::Invalid, format!("No device named {}", name))
}

fn no_such_pool(name: &str) -> ThinsetError {
    ThinsetError::Engine(ErrorEnum::Invalid, format!("No pool named {}", name))
}

impl DmApi for SimDm {
    fn driver_version(&self) -> ThinsetResult<(u32, u32, u32)> {
        Ok((4, 27, 0))
    }

    fn udev_sync_supported(&self) -> bool {
        true
    }

    fn device_info(&self, name: &str) -> ThinsetResult<Option<DmDeviceState>> {
        Ok(self
            .state()
            .devices
            .get(name)
            .map(|dev| DmDeviceState {
                open_count: dev.open_count,
            }))
    }

    fn create_pool(
        &self,
        name: &str,
        data: &Path,
        metadata_dev: &Path,
        block_size: Sectors,
    ) -> ThinsetResult<()> {
        let mut state = self.state();
        if state.devices.contains_key(name) {
            return Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!("Device {} already exists", name),
            ));
        }

        let data_bytes = metadata(state.resolve_backing(data))?.len();
        let meta_bytes = metadata(state.resolve_backing(metadata_dev))?.len();
        let length = Sectors(data_bytes >> 9);

        // Creating the pool device over metadata that already carries
        // state adopts that state; fresh metadata starts from zero.
        state
            .pools
            .entry(name.to_owned())
            .or_insert_with(|| SimPool {
                transaction_id: 0,
                thin_ids: HashSet::new(),
                length,
                used_data_blocks: 0,
                total_data_blocks: data_bytes / (u64::from(*block_size) * 512),
                used_meta_blocks: 0,
                total_meta_blocks: meta_bytes / META_BLOCK_SIZE,
            });
        state.devices.insert(
            name.to_owned(),
            SimDevice {
                open_count: 0,
                length,
            },
        );
        Ok(())
    }

    fn reload_pool(
        &self,
        name: &str,
        data: &Path,
        _metadata_dev: &Path,
        block_size: Sectors,
    ) -> ThinsetResult<()> {
        let mut state = self.state();
        let data_bytes = metadata(state.resolve_backing(data))?.len();
        let pool = state.pools.get_mut(name).ok_or_else(|| no_such_pool(name))?;
        pool.length = Sectors(data_bytes >> 9);
        pool.total_data_blocks = data_bytes / (u64::from(*block_size) * 512);
        let length = pool.length;
        state
            .devices
            .get_mut(name)
            .ok_or_else(|| no_such_device(name))?
            .length = length;
        Ok(())
    }

    fn suspend_device(&self, name: &str) -> ThinsetResult<()> {
        if self.state().devices.contains_key(name) {
            Ok(())
        } else {
            Err(no_such_device(name))
        }
    }

    fn resume_device(&self, name: &str) -> ThinsetResult<()> {
        self.suspend_device(name)
    }

    fn remove_device(&self, name: &str) -> ThinsetResult<()> {
        let mut state = self.state();
        if let Some(count) = state.busy_removals.get_mut(name) {
            if *count > 0 {
                *count -= 1;
                return Err(ThinsetError::Engine(
                    ErrorEnum::Busy,
                    format!("Device {} is busy", name),
                ));
            }
        }
        state
            .devices
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| no_such_device(name))
    }

    fn create_thin(&self, pool_name: &str, id: ThinDevId) -> ThinsetResult<()> {
        let mut state = self.state();
        let pool = state
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| no_such_pool(pool_name))?;
        if !pool.thin_ids.insert(u32::from(id)) {
            return Err(ThinsetError::Engine(
                ErrorEnum::DeviceIdExists,
                format!("Thin id {} already exists in pool {}", id, pool_name),
            ));
        }
        Ok(())
    }

    fn create_snap(
        &self,
        pool_name: &str,
        id: ThinDevId,
        _origin_name: &str,
        origin_id: ThinDevId,
    ) -> ThinsetResult<()> {
        let mut state = self.state();
        let pool = state
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| no_such_pool(pool_name))?;
        if !pool.thin_ids.contains(&u32::from(origin_id)) {
            return Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!("Origin id {} not in pool {}", origin_id, pool_name),
            ));
        }
        if !pool.thin_ids.insert(u32::from(id)) {
            return Err(ThinsetError::Engine(
                ErrorEnum::DeviceIdExists,
                format!("Thin id {} already exists in pool {}", id, pool_name),
            ));
        }
        Ok(())
    }

    fn delete_thin(&self, pool_name: &str, id: ThinDevId) -> ThinsetResult<()> {
        let mut state = self.state();
        let pool = state
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| no_such_pool(pool_name))?;
        if !pool.thin_ids.remove(&u32::from(id)) {
            return Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!("Thin id {} not in pool {}", id, pool_name),
            ));
        }
        Ok(())
    }

    fn set_transaction_id(&self, pool_name: &str, old: u64, new: u64) -> ThinsetResult<()> {
        let mut state = self.state();
        let pool = state
            .pools
            .get_mut(pool_name)
            .ok_or_else(|| no_such_pool(pool_name))?;
        if pool.transaction_id != old {
            return Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!(
                    "Transaction id mismatch on pool {}: expected {}, have {}",
                    pool_name, old, pool.transaction_id
                ),
            ));
        }
        pool.transaction_id = new;
        Ok(())
    }

    fn activate_thin(
        &self,
        pool_name: &str,
        name: &str,
        id: ThinDevId,
        size: u64,
    ) -> ThinsetResult<()> {
        let mut state = self.state();
        let pool = state
            .pools
            .get(pool_name)
            .ok_or_else(|| no_such_pool(pool_name))?;
        if !pool.thin_ids.contains(&u32::from(id)) {
            return Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!("Thin id {} not in pool {}", id, pool_name),
            ));
        }
        state.devices.insert(
            name.to_owned(),
            SimDevice {
                open_count: 0,
                length: Sectors(size >> 9),
            },
        );
        Ok(())
    }

    fn device_status(&self, name: &str) -> ThinsetResult<DmStatusLine> {
        let state = self.state();
        let device = state.devices.get(name).ok_or_else(|| no_such_device(name))?;
        match state.pools.get(name) {
            Some(pool) => Ok(DmStatusLine {
                length: pool.length,
                target_type: "thin-pool".to_owned(),
                params: format!(
                    "{} {}/{} {}/{} - rw discard_passdown queue_if_no_space",
                    pool.transaction_id,
                    pool.used_meta_blocks,
                    pool.total_meta_blocks,
                    pool.used_data_blocks,
                    pool.total_data_blocks
                ),
            }),
            None => Ok(DmStatusLine {
                length: device.length,
                target_type: "thin".to_owned(),
                params: format!("0 {}", *device.length),
            }),
        }
    }

    fn block_discard(&self, _devnode: &Path) -> ThinsetResult<()> {
        Ok(())
    }

    fn attach_loop(&self, backing: &Path) -> ThinsetResult<PathBuf> {
        let mut state = self.state();
        if let Some(node) = state.loops.get(backing) {
            return Ok(node.clone());
        }
        let node = PathBuf::from(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state.loops.insert(backing.to_owned(), node.clone());
        Ok(node)
    }

    fn loop_set_capacity(&self, backing: &Path) -> ThinsetResult<()> {
        if self.state().loops.contains_key(backing) {
            Ok(())
        } else {
            Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                format!("Unable to find loopback mount for {:?}", backing),
            ))
        }
    }
}

#[derive(Debug, Default)]
struct SimFsState {
    formatted: HashMap<PathBuf, String>,
    mounts: HashMap<PathBuf, PathBuf>,
    reject_discard: bool,
    discard_rejections: u32,
}

/// A simulated filesystem toolbox.
#[derive(Debug, Clone, Default)]
pub struct SimFs {
    state: Arc<Mutex<SimFsState>>,
}

impl SimFs {
    pub fn new() -> SimFs {
        SimFs::default()
    }

    fn state(&self) -> MutexGuard<'_, SimFsState> {
        self.state.lock().expect("only panics if a lock holder panicked")
    }

    /// Make mounts with a "discard" option fail with EINVAL, like a
    /// filesystem that does not know the option.
    pub fn reject_discard(&self) {
        self.state().reject_discard = true;
    }

    pub fn discard_rejections(&self) -> u32 {
        self.state().discard_rejections
    }

    pub fn formatted(&self, devnode: &Path) -> Option<String> {
        self.state().formatted.get(devnode).cloned()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.state().mounts.contains_key(target)
    }

    pub fn mount_count(&self) -> usize {
        self.state().mounts.len()
    }
}

impl FsApi for SimFs {
    fn create_filesystem(
        &self,
        kind: FilesystemKind,
        _mkfs_args: &[String],
        devnode: &Path,
    ) -> ThinsetResult<()> {
        self.state()
            .formatted
            .insert(devnode.to_owned(), kind.to_string());
        Ok(())
    }

    fn probe_fs_type(&self, devnode: &Path) -> ThinsetResult<String> {
        // Snapshots inherit the base volume's filesystem without being
        // formatted themselves, so default to ext4 for unknown nodes.
        Ok(self
            .state()
            .formatted
            .get(devnode)
            .cloned()
            .unwrap_or_else(|| "ext4".to_owned()))
    }

    fn mount(
        &self,
        devnode: &Path,
        target: &Path,
        _fstype: &str,
        options: &str,
    ) -> ThinsetResult<()> {
        let mut state = self.state();
        if state.reject_discard && options.split(',').any(|opt| opt == "discard") {
            state.discard_rejections += 1;
            return Err(ThinsetError::Nix(nix::errno::Errno::EINVAL));
        }
        state.mounts.insert(target.to_owned(), devnode.to_owned());
        Ok(())
    }

    fn unmount_detach(&self, target: &Path) -> ThinsetResult<()> {
        self.state()
            .mounts
            .remove(target)
            .map(|_| ())
            .ok_or_else(|| {
                ThinsetError::Engine(ErrorEnum::Invalid, format!("{:?} is not mounted", target))
            })
    }
}
