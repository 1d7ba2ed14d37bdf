// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The device set: one thin-pool, a registry of per-hash thin devices
// carved out of it, and the crash-safe bookkeeping that ties the two
// together.

use std::{
    fs::{DirBuilder, OpenOptions},
    ops::{Deref, DerefMut},
    os::unix::fs::{DirBuilderExt, OpenOptionsExt},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::Duration,
};

use nix::errno::Errno;

use devicemapper::{Sectors, ThinDevId};

use crate::{
    engine::{
        cmd::{join_mount_options, FsApi, LinuxFs},
        config::DeviceSetConfig,
        dm::DmApi,
        dm_linux::LinuxDm,
        idmap::{DeviceIdMap, MAX_DEVICE_ID},
        metadata::MetadataStore,
        names::{dev_path, device_name, device_prefix, pool_name},
        registry::{DevInfo, DevState, DeviceRegistry},
        serde_structs::{DeviceSetSave, TransactionSave},
    },
    errors::{ErrorEnum, ThinsetError, ThinsetResult},
};

const RETRY_LIMIT: u32 = 1000;
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Metadata blocks of a thin-pool are always 4 KiB.
const META_BLOCK_BYTES: u64 = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskUsage {
    pub used: u64,
    pub total: u64,
}

/// Read-only view of the pool, reported by [`DeviceSet::status`].
#[derive(Debug, Clone)]
pub struct Status {
    pub pool_name: String,
    /// Actual block device backing the data area, when known.
    pub data_file: Option<PathBuf>,
    /// Loopback file behind the data device, if one was attached.
    pub data_loopback: Option<PathBuf>,
    pub metadata_file: Option<PathBuf>,
    pub metadata_loopback: Option<PathBuf>,
    pub data: DiskUsage,
    pub metadata: DiskUsage,
    pub sector_size: u64,
    pub udev_sync_supported: bool,
}

/// Read-only view of one device, reported by
/// [`DeviceSet::get_device_status`].
#[derive(Debug, Clone)]
pub struct DevStatus {
    pub device_id: u32,
    pub size: u64,
    pub transaction_id: u64,
    pub size_in_sectors: u64,
    pub mapped_sectors: u64,
    pub highest_mapped_sector: u64,
}

/// Everything guarded by the global device-set lock: the kernel handle
/// (the library underneath is not thread-safe), the id bitmap and cursor,
/// the pool transaction id and the single pending-transaction slot.
struct DmCore {
    dm: Box<dyn DmApi>,
    id_map: DeviceIdMap,
    /// The pool's current transaction id.
    transaction_id: u64,
    /// The open transaction. `open_transaction_id == transaction_id`
    /// means none is pending.
    transaction: TransactionSave,
    backing: PoolBacking,
}

#[derive(Debug, Default)]
struct PoolBacking {
    data_device: Option<PathBuf>,
    data_loop_file: Option<PathBuf>,
    metadata_device: Option<PathBuf>,
    metadata_loop_file: Option<PathBuf>,
}

/// Holder of the global lock. Long waits go through [`CoreGuard::sleep`],
/// which releases the lock for the duration so other devices and the
/// kernel can make progress; the caller's per-device lock stays held the
/// whole time, so nobody else can touch the device being waited on.
struct CoreGuard<'a> {
    lock: &'a Mutex<DmCore>,
    guard: Option<MutexGuard<'a, DmCore>>,
}

impl<'a> CoreGuard<'a> {
    fn sleep(&mut self, duration: Duration) {
        self.guard = None;
        thread::sleep(duration);
        self.guard = Some(
            self.lock
                .lock()
                .expect("only panics if a lock holder panicked"),
        );
    }
}

impl<'a> Deref for CoreGuard<'a> {
    type Target = DmCore;

    fn deref(&self) -> &DmCore {
        self.guard.as_ref().expect("held except within sleep")
    }
}

impl<'a> DerefMut for CoreGuard<'a> {
    fn deref_mut(&mut self) -> &mut DmCore {
        self.guard.as_mut().expect("held except within sleep")
    }
}

struct ThinPoolStatus {
    total_sectors: Sectors,
    transaction_id: u64,
    meta_used: u64,
    meta_total: u64,
    data_used: u64,
    data_total: u64,
}

/// A fleet of copy-on-write thin volumes, each identified by a content
/// hash, sharing one thin-pool.
///
/// Lock order: a per-device lock is always taken before the global core
/// lock, and a parent device's lock before its child's. The registry's
/// own mutex is a leaf, held only across map access.
pub struct DeviceSet {
    root: PathBuf,
    device_prefix: String,
    config: DeviceSetConfig,
    metadata: MetadataStore,
    registry: DeviceRegistry,
    fs: Box<dyn FsApi>,
    core: Mutex<DmCore>,
}

impl DeviceSet {
    /// Set up a device set rooted at `root`, driving the real kernel.
    /// With `do_init` the base image is created and formatted if it does
    /// not exist yet.
    pub fn new(root: &Path, do_init: bool, options: &[String]) -> ThinsetResult<DeviceSet> {
        let config = DeviceSetConfig::parse(options)?;
        let dm = LinuxDm::new().map_err(|err| {
            ThinsetError::Engine(
                ErrorEnum::NotSupported,
                format!("Unable to open a device-mapper context: {}", err),
            )
        })?;
        DeviceSet::with_backends(root, do_init, config, Box::new(dm), Box::new(LinuxFs))
    }

    /// Set up a device set over explicit collaborator implementations.
    pub fn with_backends(
        root: &Path,
        do_init: bool,
        config: DeviceSetConfig,
        dm: Box<dyn DmApi>,
        fs: Box<dyn FsApi>,
    ) -> ThinsetResult<DeviceSet> {
        let mut builder = DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(root)?;
        let metadata_dir = root.join("metadata");
        builder.create(&metadata_dir)?;

        let device_prefix = device_prefix(root)?;
        debug!("Generated prefix: {}", device_prefix);

        let devices = DeviceSet {
            root: root.to_owned(),
            device_prefix,
            metadata: MetadataStore::new(metadata_dir, root.join("devicemapper").join("json")),
            registry: DeviceRegistry::new(),
            fs,
            core: Mutex::new(DmCore {
                dm,
                id_map: DeviceIdMap::new(0),
                transaction_id: 0,
                transaction: TransactionSave::default(),
                backing: PoolBacking::default(),
            }),
            config,
        };

        devices.init_devmapper(do_init)?;
        Ok(devices)
    }

    fn lock_core(&self) -> CoreGuard<'_> {
        CoreGuard {
            lock: &self.core,
            guard: Some(
                self.core
                    .lock()
                    .expect("only panics if a lock holder panicked"),
            ),
        }
    }

    fn loopback_dir(&self) -> PathBuf {
        self.root.join("devicemapper")
    }

    fn pool_name(&self) -> String {
        match self.config.thin_pool_device {
            Some(ref name) => name.clone(),
            None => pool_name(&self.device_prefix),
        }
    }

    fn has_image(&self, name: &str) -> bool {
        self.loopback_dir().join(name).exists()
    }

    /// Create a sparse file of `size` bytes at `<root>/devicemapper/<name>`
    /// if it does not exist; either way return its path.
    fn ensure_image(&self, name: &str, size: u64) -> ThinsetResult<PathBuf> {
        let dirname = self.loopback_dir();
        let filename = dirname.join(name);

        let mut builder = DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(&dirname)?;

        if !filename.exists() {
            debug!("Creating loopback file {:?} for device-manage use", filename);
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .mode(0o600)
                .open(&filename)?;
            file.set_len(size)?;
        }
        Ok(filename)
    }

    // Startup

    fn init_devmapper(&self, do_init: bool) -> ThinsetResult<()> {
        {
            let mut core = self.lock_core();

            core.dm.driver_version().map_err(|err| {
                ThinsetError::Engine(
                    ErrorEnum::NotSupported,
                    format!("Unable to query the device-mapper driver: {}", err),
                )
            })?;
            if !core.dm.udev_sync_supported() {
                warn!(
                    "Udev sync is not supported; this may lead to unexpected \
                     behavior and data loss"
                );
            }

            let pool = self.pool_name();
            debug!("Checking for existence of the pool '{}'", pool);
            let pool_exists = core.dm.device_info(&pool)?.is_some();

            let mut created_loopback = false;
            if !pool_exists && self.config.thin_pool_device.is_none() {
                debug!("Pool doesn't exist, creating it");

                let data_node = match self.config.data_device {
                    Some(ref device) => device.clone(),
                    None => {
                        let has_data = self.has_image("data");
                        if !do_init && !has_data {
                            return Err(ThinsetError::Engine(
                                ErrorEnum::Error,
                                "Loopback data file not found".into(),
                            ));
                        }
                        created_loopback = created_loopback || !has_data;
                        let file = self.ensure_image("data", self.config.data_loopback_size)?;
                        let node = core.dm.attach_loop(&file)?;
                        core.backing.data_loop_file = Some(file);
                        node
                    }
                };
                core.backing.data_device = Some(data_node.clone());

                let metadata_node = match self.config.metadata_device {
                    Some(ref device) => device.clone(),
                    None => {
                        let has_metadata = self.has_image("metadata");
                        if !do_init && !has_metadata {
                            return Err(ThinsetError::Engine(
                                ErrorEnum::Error,
                                "Loopback metadata file not found".into(),
                            ));
                        }
                        created_loopback = created_loopback || !has_metadata;
                        let file =
                            self.ensure_image("metadata", self.config.meta_loopback_size)?;
                        let node = core.dm.attach_loop(&file)?;
                        core.backing.metadata_loop_file = Some(file);
                        node
                    }
                };
                core.backing.metadata_device = Some(metadata_node.clone());

                core.dm.create_pool(
                    &pool,
                    &data_node,
                    &metadata_node,
                    self.config.thin_block_size,
                )?;
            }

            // A freshly created backing pair has no transaction history
            // or legacy metadata to pick up.
            if !created_loopback {
                self.init_metadata(&mut core)?;
            }

            if let Some(save) = self.metadata.load_device_set()? {
                core.id_map.set_cursor(save.next_device_id);
            }
        }

        if do_init {
            self.setup_base_image()?;
        }

        let core = self.lock_core();
        self.save_device_set(&core);
        Ok(())
    }

    /// Pick up on-disk state for an existing pool: migrate any legacy
    /// metadata, rebuild the id bitmap from the per-device records, and
    /// replay the pending transaction against the pool's transaction id.
    fn init_metadata(&self, core: &mut DmCore) -> ThinsetResult<()> {
        debug!("initMetadata()");
        self.metadata.migrate_legacy()?;

        core.transaction_id = self.pool_status(core)?.transaction_id;

        for (hash, save) in self.metadata.walk_devices()? {
            if save.device_id > MAX_DEVICE_ID {
                error!("Ignoring invalid device id {} of device {}", save.device_id, hash);
                continue;
            }
            let device_id = ThinDevId::new_u64(u64::from(save.device_id))?;
            self.registry.insert_loaded(&hash, &save)?;
            core.id_map.mark_used(device_id);
            debug!("Added device id {} to the id map", save.device_id);
        }

        self.process_pending_transaction(core)?;
        debug!("initMetadata() END");
        Ok(())
    }

    // Transaction log

    fn open_transaction(
        &self,
        core: &mut DmCore,
        hash: &str,
        device_id: ThinDevId,
    ) -> ThinsetResult<()> {
        core.transaction = TransactionSave {
            open_transaction_id: core.transaction_id + 1,
            device_hash: hash.to_owned(),
            device_id: u32::from(device_id),
        };
        self.metadata.save_transaction(&core.transaction)
    }

    /// Move the open transaction onto a different device id.
    fn refresh_transaction(&self, core: &mut DmCore, device_id: ThinDevId) -> ThinsetResult<()> {
        core.transaction.device_id = u32::from(device_id);
        self.metadata.save_transaction(&core.transaction)
    }

    /// Advance the pool's transaction id to the open one. The pending
    /// record is not deleted; it is superseded by equality of the ids.
    fn close_transaction(&self, core: &mut DmCore) -> ThinsetResult<()> {
        let (current, open) = (core.transaction_id, core.transaction.open_transaction_id);
        core.dm
            .set_transaction_id(&self.pool_name(), current, open)
            .map_err(|err| {
                debug!("Failed to close transaction");
                err
            })?;
        core.transaction_id = open;
        Ok(())
    }

    fn process_pending_transaction(&self, core: &mut DmCore) -> ThinsetResult<()> {
        match self.metadata.load_transaction() {
            Ok(Some(transaction)) => {
                core.transaction = transaction;
                // Reserve the pending id; rollback or a later delete
                // frees it.
                if let Ok(id) = ThinDevId::new_u64(u64::from(core.transaction.device_id)) {
                    core.id_map.mark_used(id);
                }
            }
            Ok(None) => {
                core.transaction = TransactionSave {
                    open_transaction_id: core.transaction_id,
                    ..TransactionSave::default()
                };
                return Ok(());
            }
            Err(ThinsetError::Serde(err)) => {
                warn!("Ignoring unparseable pending-transaction record: {}", err);
                core.transaction = TransactionSave {
                    open_transaction_id: core.transaction_id,
                    ..TransactionSave::default()
                };
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        let open = core.transaction.open_transaction_id;
        if open == core.transaction_id {
            return Ok(());
        }

        if open < core.transaction_id {
            error!(
                "Open transaction id {} is less than pool transaction id {}",
                open, core.transaction_id
            );
            core.transaction.open_transaction_id = core.transaction_id;
            return Ok(());
        }

        // The transaction never committed; undo whatever of it exists.
        self.rollback_transaction(core);
        core.transaction.open_transaction_id = core.transaction_id;
        Ok(())
    }

    /// Best-effort: every step may legitimately find nothing to undo, so
    /// failures are logged and never fatal, to avoid wedging the whole
    /// pool on one corrupt transaction.
    fn rollback_transaction(&self, core: &mut DmCore) {
        let transaction = core.transaction.clone();
        debug!(
            "Rolling back open transaction: TransactionId={} hash={} device_id={}",
            transaction.open_transaction_id, transaction.device_hash, transaction.device_id
        );

        match ThinDevId::new_u64(u64::from(transaction.device_id)) {
            Ok(device_id) => {
                // The create may never have reached the pool.
                if let Err(err) = core.dm.delete_thin(&self.pool_name(), device_id) {
                    warn!("Unable to delete device: {}", err);
                }
                match self.metadata.remove_device(&transaction.device_hash) {
                    Ok(()) => core.id_map.mark_free(device_id),
                    Err(err) => warn!("Unable to remove metadata: {}", err),
                }
            }
            Err(err) => warn!(
                "Ignoring invalid device id {} in pending transaction: {}",
                transaction.device_id, err
            ),
        }

        if let Err(err) = self.metadata.remove_transaction() {
            warn!("Unable to remove pending-transaction record: {}", err);
        }
    }

    // Device creation

    fn create_register_device(&self, core: &mut DmCore, hash: &str) -> ThinsetResult<Arc<DevInfo>> {
        let pool = self.pool_name();
        let mut device_id = core.id_map.next_free_id()?;

        if let Err(err) = self.open_transaction(core, hash, device_id) {
            debug!(
                "Error opening transaction hash = {} deviceId = {}",
                hash,
                u32::from(device_id)
            );
            core.id_map.mark_free(device_id);
            return Err(err);
        }

        loop {
            match core.dm.create_thin(&pool, device_id) {
                Ok(()) => break,
                Err(ThinsetError::Engine(ErrorEnum::DeviceIdExists, _)) => {
                    // The bitmap said free but the pool disagrees; take a
                    // fresh id and move the open transaction onto it.
                    error!(
                        "Device id {} exists in pool but it is supposed to be unused",
                        u32::from(device_id)
                    );
                    device_id = core.id_map.next_free_id()?;
                    self.refresh_transaction(core, device_id)?;
                }
                Err(err) => {
                    debug!("Error creating device: {}", err);
                    core.id_map.mark_free(device_id);
                    return Err(err);
                }
            }
        }

        debug!(
            "Registering device (id {}) with FS size {}",
            u32::from(device_id),
            self.config.base_fs_size
        );
        let open_transaction_id = core.transaction.open_transaction_id;
        let info = match self.registry.register(
            &self.metadata,
            hash,
            device_id,
            self.config.base_fs_size,
            open_transaction_id,
        ) {
            Ok(info) => info,
            Err(err) => {
                if let Err(err) = core.dm.delete_thin(&pool, device_id) {
                    warn!("Unable to delete just-created device: {}", err);
                }
                core.id_map.mark_free(device_id);
                return Err(err);
            }
        };

        if let Err(err) = self.close_transaction(core) {
            if let Err(err) = self.registry.unregister(&self.metadata, device_id, hash) {
                warn!("Unable to unregister device: {}", err);
            }
            if let Err(err) = core.dm.delete_thin(&pool, device_id) {
                warn!("Unable to delete just-created device: {}", err);
            }
            core.id_map.mark_free(device_id);
            return Err(err);
        }

        Ok(info)
    }

    fn create_register_snap_device(
        &self,
        core: &mut DmCore,
        hash: &str,
        base_hash: &str,
        base_state: &DevState,
    ) -> ThinsetResult<()> {
        let pool = self.pool_name();
        let base_name = device_name(&self.device_prefix, base_hash);
        let mut device_id = core.id_map.next_free_id()?;

        if let Err(err) = self.open_transaction(core, hash, device_id) {
            debug!(
                "Error opening transaction hash = {} deviceId = {}",
                hash,
                u32::from(device_id)
            );
            core.id_map.mark_free(device_id);
            return Err(err);
        }

        loop {
            match core
                .dm
                .create_snap(&pool, device_id, &base_name, base_state.device_id)
            {
                Ok(()) => break,
                Err(ThinsetError::Engine(ErrorEnum::DeviceIdExists, _)) => {
                    error!(
                        "Device id {} exists in pool but it is supposed to be unused",
                        u32::from(device_id)
                    );
                    device_id = core.id_map.next_free_id()?;
                    self.refresh_transaction(core, device_id)?;
                }
                Err(err) => {
                    debug!("Error creating snap device: {}", err);
                    core.id_map.mark_free(device_id);
                    return Err(err);
                }
            }
        }

        // A snapshot inherits its parent's provisioned size.
        let open_transaction_id = core.transaction.open_transaction_id;
        if let Err(err) = self.registry.register(
            &self.metadata,
            hash,
            device_id,
            base_state.size,
            open_transaction_id,
        ) {
            if let Err(err) = core.dm.delete_thin(&pool, device_id) {
                warn!("Unable to delete just-created snapshot: {}", err);
            }
            core.id_map.mark_free(device_id);
            debug!("Error registering device: {}", err);
            return Err(err);
        }

        if let Err(err) = self.close_transaction(core) {
            if let Err(err) = self.registry.unregister(&self.metadata, device_id, hash) {
                warn!("Unable to unregister device: {}", err);
            }
            if let Err(err) = core.dm.delete_thin(&pool, device_id) {
                warn!("Unable to delete just-created snapshot: {}", err);
            }
            core.id_map.mark_free(device_id);
            return Err(err);
        }

        Ok(())
    }

    /// Make the base device (the empty hash) exist, formatted and marked
    /// initialized. A stale half-initialized base from an earlier crash
    /// is deleted and rebuilt.
    fn setup_base_image(&self) -> ThinsetResult<()> {
        let old_info = match self.registry.lookup(&self.metadata, "") {
            Ok(info) => Some(info),
            Err(ThinsetError::Engine(ErrorEnum::UnknownDevice, _)) => None,
            Err(err) => return Err(err),
        };

        if let Some(ref info) = old_info {
            if info.lock().initialized {
                return Ok(());
            }
            debug!("Removing uninitialized base image");
            self.delete_device("")?;
        }

        if self.config.thin_pool_device.is_some() && old_info.is_none() {
            // Refuse to adopt an external pool that is not pristine.
            let core = self.lock_core();
            let status = self.pool_status(&core)?;
            if status.data_used != 0 {
                return Err(ThinsetError::Engine(
                    ErrorEnum::Invalid,
                    format!(
                        "Unable to take ownership of thin-pool ({}) that already has used data blocks",
                        self.pool_name()
                    ),
                ));
            }
            if status.transaction_id != 0 {
                return Err(ThinsetError::Engine(
                    ErrorEnum::Invalid,
                    format!(
                        "Unable to take ownership of thin-pool ({}) with non-zero transaction id",
                        self.pool_name()
                    ),
                ));
            }
        }

        debug!("Initializing base device-mapper thin volume");
        let mut core = self.lock_core();
        let info = self.create_register_device(&mut core, "")?;
        // Startup only: the set is not shared yet, so taking the fresh
        // record's lock after the core lock cannot deadlock.
        let mut state = info.lock();

        debug!("Creating filesystem on base device-mapper thin volume");
        self.activate_device_if_needed(&core, "", &state)?;
        self.fs.create_filesystem(
            self.config.filesystem,
            &self.config.mkfs_args,
            &dev_path(&device_name(&self.device_prefix, "")),
        )?;

        state.initialized = true;
        if let Err(err) = self.metadata.save_device("", &state.to_save()) {
            state.initialized = false;
            return Err(err);
        }

        Ok(())
    }

    // Activation

    fn activate_device_if_needed(
        &self,
        core: &DmCore,
        hash: &str,
        state: &DevState,
    ) -> ThinsetResult<()> {
        debug!("activateDeviceIfNeeded({})", hash);
        let name = device_name(&self.device_prefix, hash);
        if core.dm.device_info(&name)?.is_some() {
            return Ok(());
        }
        core.dm
            .activate_thin(&self.pool_name(), &name, state.device_id, state.size)
    }

    /// Wait for the device's open count to drop to zero, then remove it
    /// from the kernel's table.
    fn deactivate_device(&self, core: &mut CoreGuard<'_>, hash: &str) -> ThinsetResult<()> {
        debug!("deactivateDevice({})", hash);
        let name = device_name(&self.device_prefix, hash);

        if let Err(err) = self.wait_close(core, &name) {
            error!("Error waiting for device {} to close: {}", hash, err);
        }

        if core.dm.device_info(&name)?.is_some() {
            self.remove_device_and_wait(core, &name)?;
        }
        debug!("deactivateDevice END({})", hash);
        Ok(())
    }

    /// Issue the remove, retrying while the kernel reports the device
    /// busy, then wait for it to actually disappear.
    fn remove_device_and_wait(&self, core: &mut CoreGuard<'_>, name: &str) -> ThinsetResult<()> {
        let mut removed = false;
        for _ in 0..RETRY_LIMIT {
            match core.dm.remove_device(name) {
                Ok(()) => {
                    removed = true;
                    break;
                }
                Err(ThinsetError::Engine(ErrorEnum::Busy, _)) => {
                    core.sleep(RETRY_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        }
        if !removed {
            return Err(ThinsetError::Engine(
                ErrorEnum::Timeout,
                format!("Timeout while waiting to remove busy device {}", name),
            ));
        }

        self.wait_remove(core, name)
    }

    /// Poll until the kernel no longer knows the name, for at most the
    /// 10 second budget.
    fn wait_remove(&self, core: &mut CoreGuard<'_>, name: &str) -> ThinsetResult<()> {
        debug!("[deviceset {}] waitRemove({})", self.device_prefix, name);
        for i in 0..RETRY_LIMIT {
            match core.dm.device_info(name)? {
                None => {
                    debug!("[deviceset {}] waitRemove({}) END", self.device_prefix, name);
                    return Ok(());
                }
                Some(_) => {
                    if i % 100 == 0 {
                        debug!("Waiting for removal of {}", name);
                    }
                    core.sleep(RETRY_INTERVAL);
                }
            }
        }
        Err(ThinsetError::Engine(
            ErrorEnum::Timeout,
            format!("Timeout while waiting for device {} to be removed", name),
        ))
    }

    /// Poll until the open count drops to zero, for at most the 10 second
    /// budget.
    fn wait_close(&self, core: &mut CoreGuard<'_>, name: &str) -> ThinsetResult<()> {
        for i in 0..RETRY_LIMIT {
            let open_count = match core.dm.device_info(name)? {
                None => 0,
                Some(state) => state.open_count,
            };
            if i % 100 == 0 {
                debug!("Waiting for unmount of {}: opencount={}", name, open_count);
            }
            if open_count == 0 {
                return Ok(());
            }
            core.sleep(RETRY_INTERVAL);
        }
        Err(ThinsetError::Engine(
            ErrorEnum::Timeout,
            format!("Timeout while waiting for device {} to close", name),
        ))
    }

    // Public operations

    /// Create a snapshot of `base_hash` registered under `hash`. The new
    /// device is not activated.
    pub fn add_device(&self, hash: &str, base_hash: &str) -> ThinsetResult<()> {
        debug!("AddDevice() hash={} basehash={}", hash, base_hash);
        let base_info = self.registry.lookup(&self.metadata, base_hash)?;
        let base_state = base_info.lock();
        let mut core = self.lock_core();

        match self.registry.lookup(&self.metadata, hash) {
            Ok(_) => {
                return Err(ThinsetError::Engine(
                    ErrorEnum::DeviceExists,
                    format!("device {} already exists", hash),
                ));
            }
            Err(ThinsetError::Engine(ErrorEnum::UnknownDevice, _)) => (),
            Err(err) => return Err(err),
        }

        self.create_register_snap_device(&mut core, hash, base_hash, &base_state)?;
        debug!("AddDevice(hash={} basehash={}) END", hash, base_hash);
        Ok(())
    }

    /// Delete the device: discard its blocks if configured, deactivate it,
    /// then remove it from the pool and the metadata store under one
    /// transaction.
    pub fn delete_device(&self, hash: &str) -> ThinsetResult<()> {
        let info = self.registry.lookup(&self.metadata, hash)?;
        let state = info.lock();
        let mut core = self.lock_core();

        if self.config.do_blk_discard {
            // The kernel does not give pool space back when a thin device
            // is deleted, so discard the blocks first. Failures only cost
            // space.
            if self.activate_device_if_needed(&core, hash, &state).is_ok() {
                let devnode = dev_path(&device_name(&self.device_prefix, hash));
                if let Err(err) = core.dm.block_discard(&devnode) {
                    debug!("Error discarding block on device: {} (ignoring)", err);
                }
            }
        }

        let name = device_name(&self.device_prefix, hash);
        if core.dm.device_info(&name)?.is_some() {
            if let Err(err) = self.remove_device_and_wait(&mut core, &name) {
                debug!("Error removing device: {}", err);
                return Err(err);
            }
        }

        self.open_transaction(&mut core, hash, state.device_id)?;
        core.dm.delete_thin(&self.pool_name(), state.device_id)?;
        self.registry
            .unregister(&self.metadata, state.device_id, hash)?;
        self.close_transaction(&mut core)?;
        core.id_map.mark_free(state.device_id);

        Ok(())
    }

    /// Mount the device at `path`, activating it first if necessary.
    /// Re-mounting at the same path only bumps the reference count.
    pub fn mount_device(&self, hash: &str, path: &Path, mount_label: &str) -> ThinsetResult<()> {
        let info = self.registry.lookup(&self.metadata, hash)?;
        let mut state = info.lock();
        let core = self.lock_core();

        if state.mount_count > 0 {
            if state.mount_path.as_deref() != Some(path) {
                return Err(ThinsetError::Engine(
                    ErrorEnum::AlreadyMountedElsewhere,
                    format!(
                        "Trying to mount device {} in multiple places ({:?}, {:?})",
                        hash, state.mount_path, path
                    ),
                ));
            }
            state.mount_count += 1;
            return Ok(());
        }

        self.activate_device_if_needed(&core, hash, &state)
            .map_err(|err| {
                ThinsetError::Engine(
                    ErrorEnum::Error,
                    format!("Error activating device for '{}': {}", hash, err),
                )
            })?;

        let devnode = dev_path(&device_name(&self.device_prefix, hash));
        let fstype = self.fs.probe_fs_type(&devnode)?;

        let mut options = String::new();
        if fstype == "xfs" {
            // XFS refuses a second mount of a filesystem with an already
            // mounted uuid, which is what every snapshot is.
            options = join_mount_options(&options, "nouuid");
        }
        options = join_mount_options(&options, &self.config.mount_options);
        options = join_mount_options(&options, &format_mount_label(mount_label));

        let mut mounted = self
            .fs
            .mount(&devnode, path, &fstype, &join_mount_options("discard", &options));
        if let Err(ThinsetError::Nix(Errno::EINVAL)) = mounted {
            // The filesystem does not know "discard"; mount without it.
            mounted = self.fs.mount(&devnode, path, &fstype, &options);
        }
        if let Err(err) = mounted {
            return Err(ThinsetError::Engine(
                ErrorEnum::Error,
                format!("Error mounting {:?} on {:?}: {}", devnode, path, err),
            ));
        }

        state.mount_count = 1;
        state.mount_path = Some(path.to_owned());
        Ok(())
    }

    /// Drop one mount reference; the last one unmounts lazily and
    /// deactivates the device.
    pub fn unmount_device(&self, hash: &str) -> ThinsetResult<()> {
        debug!("UnmountDevice(hash={})", hash);
        let info = self.registry.lookup(&self.metadata, hash)?;
        let mut state = info.lock();
        let mut core = self.lock_core();

        if state.mount_count == 0 {
            return Err(ThinsetError::Engine(
                ErrorEnum::NotMounted,
                format!("UnmountDevice: device not-mounted id {}", hash),
            ));
        }

        state.mount_count -= 1;
        if state.mount_count > 0 {
            return Ok(());
        }

        let path = state
            .mount_path
            .clone()
            .expect("mount_count > 0 implies a mount path");
        debug!("Unmount({:?})", path);
        self.fs.unmount_detach(&path)?;
        debug!("Unmount done");

        self.deactivate_device(&mut core, hash)?;
        state.mount_path = None;

        debug!("UnmountDevice(hash={}) END", hash);
        Ok(())
    }

    pub fn has_device(&self, hash: &str) -> bool {
        self.registry.lookup(&self.metadata, hash).is_ok()
    }

    pub fn has_activated_device(&self, hash: &str) -> bool {
        let info = match self.registry.lookup(&self.metadata, hash) {
            Ok(info) => info,
            Err(_) => return false,
        };
        let _state = info.lock();
        let core = self.lock_core();
        let name = device_name(&self.device_prefix, hash);
        matches!(core.dm.device_info(&name), Ok(Some(_)))
    }

    /// The hashes of all known devices. May race with concurrent
    /// creation and deletion.
    pub fn list(&self) -> Vec<String> {
        self.registry.hashes()
    }

    /// The block device backing the data area, loopback or raw, when it
    /// was set up by this process.
    pub fn data_device_path(&self) -> Option<PathBuf> {
        self.lock_core().backing.data_device.clone()
    }

    /// The block device backing the metadata area, loopback or raw, when
    /// it was set up by this process.
    pub fn metadata_device_path(&self) -> Option<PathBuf> {
        self.lock_core().backing.metadata_device.clone()
    }

    pub fn get_device_status(&self, hash: &str) -> ThinsetResult<DevStatus> {
        let info = self.registry.lookup(&self.metadata, hash)?;
        let state = info.lock();
        let core = self.lock_core();

        self.activate_device_if_needed(&core, hash, &state)
            .map_err(|err| {
                ThinsetError::Engine(
                    ErrorEnum::Error,
                    format!("Error activating device for '{}': {}", hash, err),
                )
            })?;

        let line = core
            .dm
            .device_status(&device_name(&self.device_prefix, hash))?;
        let (mapped_sectors, highest_mapped_sector) = parse_thin_params(&line.params)?;

        Ok(DevStatus {
            device_id: u32::from(state.device_id),
            size: state.size,
            transaction_id: state.transaction_id,
            size_in_sectors: *line.length,
            mapped_sectors,
            highest_mapped_sector,
        })
    }

    /// Grow the data loopback file and ripple the new size through the
    /// loop driver and the pool table. Shrinking is refused.
    pub fn resize_pool(&self, size: u64) -> ThinsetResult<()> {
        if self.config.thin_pool_device.is_some() || self.config.data_device.is_some() {
            return Err(ThinsetError::Engine(
                ErrorEnum::Invalid,
                "Only a loopback-backed data device can be resized".into(),
            ));
        }

        let core = self.lock_core();
        let data_file = core
            .backing
            .data_loop_file
            .clone()
            .unwrap_or_else(|| self.loopback_dir().join("data"));
        let metadata_file = match self.config.metadata_device {
            Some(ref device) => device.clone(),
            None => core
                .backing
                .metadata_loop_file
                .clone()
                .unwrap_or_else(|| self.loopback_dir().join("metadata")),
        };

        let file = OpenOptions::new().read(true).write(true).open(&data_file)?;
        let current = file.metadata()?.len();
        if current > size {
            return Err(ThinsetError::Engine(
                ErrorEnum::ShrinkNotAllowed,
                format!(
                    "Unable to shrink data file {:?} from {} to {} bytes",
                    data_file, current, size
                ),
            ));
        }
        file.set_len(size)?;

        core.dm.loop_set_capacity(&data_file)?;

        let pool = self.pool_name();
        core.dm.suspend_device(&pool)?;
        core.dm
            .reload_pool(&pool, &data_file, &metadata_file, self.config.thin_block_size)?;
        core.dm.resume_device(&pool)?;
        Ok(())
    }

    fn pool_status(&self, core: &DmCore) -> ThinsetResult<ThinPoolStatus> {
        let line = core.dm.device_status(&self.pool_name())?;
        let (transaction_id, meta_used, meta_total, data_used, data_total) =
            parse_pool_params(&line.params)?;
        Ok(ThinPoolStatus {
            total_sectors: line.length,
            transaction_id,
            meta_used,
            meta_total,
            data_used,
            data_total,
        })
    }

    /// The current read-only view of the pool.
    pub fn status(&self) -> Status {
        let core = self.lock_core();

        let mut status = Status {
            pool_name: self.pool_name(),
            data_file: core.backing.data_device.clone(),
            data_loopback: core.backing.data_loop_file.clone(),
            metadata_file: core.backing.metadata_device.clone(),
            metadata_loopback: core.backing.metadata_loop_file.clone(),
            data: DiskUsage::default(),
            metadata: DiskUsage::default(),
            sector_size: 0,
            udev_sync_supported: core.dm.udev_sync_supported(),
        };

        if let Ok(pool) = self.pool_status(&core) {
            if pool.data_total > 0 {
                // Convert from pool blocks to bytes.
                let block_size_sectors = *pool.total_sectors / pool.data_total;
                status.data.used = pool.data_used * block_size_sectors * 512;
                status.data.total = pool.data_total * block_size_sectors * 512;
                status.metadata.used = pool.meta_used * META_BLOCK_BYTES;
                status.metadata.total = pool.meta_total * META_BLOCK_BYTES;
                status.sector_size = block_size_sectors * 512;
            }
        }

        status
    }

    fn deactivate_pool(&self, core: &mut DmCore) -> ThinsetResult<()> {
        debug!("deactivatePool()");
        let pool = self.pool_name();
        if core.dm.device_info(&pool)?.is_some() {
            core.dm.remove_device(&pool)?;
        }
        debug!("deactivatePool END");
        Ok(())
    }

    fn save_device_set(&self, core: &DmCore) {
        let save = DeviceSetSave {
            next_device_id: core.id_map.cursor(),
        };
        if let Err(err) = self.metadata.save_device_set(&save) {
            warn!("Unable to save deviceset metadata: {}", err);
        }
    }

    /// Unmount and deactivate everything, deactivate the pool unless it
    /// is externally owned, and persist the deviceset record. Failures
    /// along the way are logged and skipped.
    pub fn shutdown(&self) -> ThinsetResult<()> {
        debug!("[deviceset {}] shutdown()", self.device_prefix);

        for info in self.registry.snapshot() {
            let mut state = info.lock();
            if state.mount_count > 0 {
                let path = state
                    .mount_path
                    .clone()
                    .expect("mount_count > 0 implies a mount path");
                // MNT_DETACH: a tree still busy in some running container
                // leaves the namespace now and is released when its last
                // user exits.
                if let Err(err) = self.fs.unmount_detach(&path) {
                    debug!("Shutdown unmounting {:?}, error: {}", path, err);
                }

                let mut core = self.lock_core();
                if let Err(err) = self.deactivate_device(&mut core, info.hash()) {
                    debug!("Shutdown deactivate {}, error: {}", info.hash(), err);
                }
                state.mount_count = 0;
                state.mount_path = None;
            }
        }

        if let Ok(info) = self.registry.lookup(&self.metadata, "") {
            let _state = info.lock();
            let mut core = self.lock_core();
            if let Err(err) = self.deactivate_device(&mut core, "") {
                debug!("Shutdown deactivate base, error: {}", err);
            }
        }

        let mut core = self.lock_core();
        if self.config.thin_pool_device.is_none() {
            if let Err(err) = self.deactivate_pool(&mut core) {
                debug!("Shutdown deactivate pool, error: {}", err);
            }
        }
        self.save_device_set(&core);

        debug!("[deviceset {}] shutdown END", self.device_prefix);
        Ok(())
    }
}

fn format_mount_label(mount_label: &str) -> String {
    if mount_label.is_empty() {
        String::new()
    } else {
        format!("context=\"{}\"", mount_label)
    }
}

fn parse_fraction(value: &str) -> Option<(u64, u64)> {
    let mut parts = value.splitn(2, '/');
    let used = parts.next()?.parse::<u64>().ok()?;
    let total = parts.next()?.parse::<u64>().ok()?;
    Some((used, total))
}

/// Parse the params of a thin-pool status line:
/// `<transaction id> <used meta>/<total meta> <used data>/<total data> ...`.
/// A pool in a failed state reports the single word "Fail" instead.
fn parse_pool_params(params: &str) -> ThinsetResult<(u64, u64, u64, u64, u64)> {
    let fields = params.split_whitespace().collect::<Vec<_>>();
    let parsed = if fields.len() >= 3 {
        match (
            fields[0].parse::<u64>().ok(),
            parse_fraction(fields[1]),
            parse_fraction(fields[2]),
        ) {
            (Some(transaction_id), Some((meta_used, meta_total)), Some((data_used, data_total))) => {
                Some((transaction_id, meta_used, meta_total, data_used, data_total))
            }
            _ => None,
        }
    } else {
        None
    };
    parsed.ok_or_else(|| {
        ThinsetError::Engine(
            ErrorEnum::Invalid,
            format!("Unparseable thin-pool status params \"{}\"", params),
        )
    })
}

/// Parse the params of a thin device status line:
/// `<mapped sectors> <highest mapped sector>`.
fn parse_thin_params(params: &str) -> ThinsetResult<(u64, u64)> {
    let fields = params.split_whitespace().collect::<Vec<_>>();
    let parsed = if fields.len() >= 2 {
        match (fields[0].parse::<u64>().ok(), fields[1].parse::<u64>().ok()) {
            (Some(mapped), Some(highest)) => Some((mapped, highest)),
            _ => None,
        }
    } else {
        None
    };
    parsed.ok_or_else(|| {
        ThinsetError::Engine(
            ErrorEnum::Invalid,
            format!("Unparseable thin status params \"{}\"", params),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pool_params() {
        let (transaction_id, meta_used, meta_total, data_used, data_total) =
            parse_pool_params("5 12/4096 100/25600 - rw discard_passdown").unwrap();
        assert_eq!(transaction_id, 5);
        assert_eq!((meta_used, meta_total), (12, 4096));
        assert_eq!((data_used, data_total), (100, 25600));

        assert!(parse_pool_params("Fail").is_err());
        assert!(parse_pool_params("").is_err());
        assert!(parse_pool_params("5 12 100").is_err());
    }

    #[test]
    fn test_parse_thin_params() {
        assert_eq!(parse_thin_params("1024 2047").unwrap(), (1024, 2047));
        assert_eq!(parse_thin_params("0 0 -").unwrap(), (0, 0));
        assert!(parse_thin_params("Fail").is_err());
    }

    #[test]
    fn test_format_mount_label() {
        assert_eq!(format_mount_label(""), "");
        assert_eq!(
            format_mount_label("system_u:object_r:svirt_t:s0"),
            "context=\"system_u:object_r:svirt_t:s0\""
        );
    }
}
