// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The in-memory device registry: hash -> record, loaded lazily from the
// metadata store and guarded by its own mutex so existence probes and
// listings do not contend with the global device-set lock.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use devicemapper::ThinDevId;

use crate::{
    engine::{metadata::MetadataStore, serde_structs::DeviceSave},
    errors::{ErrorEnum, ThinsetError, ThinsetResult},
};

/// All mutable state of one device record. Persisted fields and the
/// runtime-only mount bookkeeping share the record's mutex: whoever holds
/// it owns the device.
#[derive(Debug)]
pub struct DevState {
    pub device_id: ThinDevId,
    pub size: u64,
    pub transaction_id: u64,
    pub initialized: bool,
    pub mount_count: u32,
    pub mount_path: Option<PathBuf>,
}

impl DevState {
    pub fn from_save(save: &DeviceSave) -> ThinsetResult<DevState> {
        Ok(DevState {
            device_id: ThinDevId::new_u64(u64::from(save.device_id))?,
            size: save.size,
            transaction_id: save.transaction_id,
            initialized: save.initialized,
            mount_count: 0,
            mount_path: None,
        })
    }

    pub fn to_save(&self) -> DeviceSave {
        DeviceSave {
            device_id: u32::from(self.device_id),
            size: self.size,
            transaction_id: self.transaction_id,
            initialized: self.initialized,
        }
    }
}

/// One device record. The per-device mutex lives for the record's
/// lifetime and must always be taken before the global device-set lock.
#[derive(Debug)]
pub struct DevInfo {
    hash: String,
    state: Mutex<DevState>,
}

impl DevInfo {
    fn new(hash: &str, state: DevState) -> Arc<DevInfo> {
        Arc::new(DevInfo {
            hash: hash.to_owned(),
            state: Mutex::new(state),
        })
    }

    /// The empty hash denotes the base device.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn lock(&self) -> MutexGuard<'_, DevState> {
        self.state
            .lock()
            .expect("only panics if a lock holder panicked")
    }
}

#[derive(Debug)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<DevInfo>>>,
}

impl DeviceRegistry {
    pub fn new() -> DeviceRegistry {
        DeviceRegistry {
            devices: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<DevInfo>>> {
        self.devices
            .lock()
            .expect("only panics if a lock holder panicked")
    }

    /// Fetch the record for a hash, loading it from the store on a cache
    /// miss. Fails with `UnknownDevice` if there is no record at all.
    pub fn lookup(&self, store: &MetadataStore, hash: &str) -> ThinsetResult<Arc<DevInfo>> {
        let mut map = self.map();
        if let Some(info) = map.get(hash) {
            return Ok(Arc::clone(info));
        }

        match store.load_device(hash)? {
            Some(save) => {
                let info = DevInfo::new(hash, DevState::from_save(&save)?);
                map.insert(hash.to_owned(), Arc::clone(&info));
                Ok(info)
            }
            None => Err(ThinsetError::Engine(
                ErrorEnum::UnknownDevice,
                format!("Unknown device {}", hash),
            )),
        }
    }

    /// Insert a record loaded during the startup walk.
    pub fn insert_loaded(&self, hash: &str, save: &DeviceSave) -> ThinsetResult<Arc<DevInfo>> {
        let info = DevInfo::new(hash, DevState::from_save(save)?);
        self.map().insert(hash.to_owned(), Arc::clone(&info));
        Ok(info)
    }

    /// Construct and persist a fresh record. If the record cannot be
    /// persisted it is evicted again and the error propagates.
    pub fn register(
        &self,
        store: &MetadataStore,
        hash: &str,
        device_id: ThinDevId,
        size: u64,
        transaction_id: u64,
    ) -> ThinsetResult<Arc<DevInfo>> {
        debug!("registerDevice({}, {})", u32::from(device_id), hash);
        let info = DevInfo::new(
            hash,
            DevState {
                device_id,
                size,
                transaction_id,
                initialized: false,
                mount_count: 0,
                mount_path: None,
            },
        );

        self.map().insert(hash.to_owned(), Arc::clone(&info));

        let save = info.lock().to_save();
        if let Err(err) = store.save_device(hash, &save) {
            self.map().remove(hash);
            return Err(err);
        }

        Ok(info)
    }

    /// Evict the record and remove its metadata file.
    pub fn unregister(
        &self,
        store: &MetadataStore,
        device_id: ThinDevId,
        hash: &str,
    ) -> ThinsetResult<()> {
        debug!("unregisterDevice({}, {})", u32::from(device_id), hash);
        self.map().remove(hash);
        store.remove_device(hash)
    }

    /// A consistent snapshot of the cached records. May race with
    /// concurrent creation and deletion.
    pub fn snapshot(&self) -> Vec<Arc<DevInfo>> {
        self.map().values().map(Arc::clone).collect()
    }

    pub fn hashes(&self) -> Vec<String> {
        self.map().keys().cloned().collect()
    }
}
