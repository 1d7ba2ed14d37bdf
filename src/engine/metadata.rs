// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The on-disk metadata store: one JSON file per device named by hash,
// a deviceset-level record, and the single-slot pending-transaction record.

use std::{
    fs::{read_to_string, remove_file, rename},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use tempfile::Builder;

use crate::{
    engine::{
        names::record_name,
        serde_structs::{DeviceSave, DeviceSetSave, LegacyMetaData, TransactionSave},
    },
    errors::ThinsetResult,
};

const DEVICE_SET_META_FILE: &str = "deviceset-metadata";
const TRANSACTION_META_FILE: &str = "transaction-metadata";
/// Suffix marking an already-migrated legacy file; kept for forensics and
/// always skipped on scan.
const MIGRATED_SUFFIX: &str = ".migrated";
/// Prefix of the transient sibling files the atomic writer creates.
const TMP_PREFIX: &str = ".tmp";

#[derive(Debug)]
pub struct MetadataStore {
    metadata_dir: PathBuf,
    /// The aggregate metadata file of the old format, outside the
    /// metadata directory.
    legacy_file: PathBuf,
}

impl MetadataStore {
    pub fn new(metadata_dir: PathBuf, legacy_file: PathBuf) -> MetadataStore {
        MetadataStore {
            metadata_dir,
            legacy_file,
        }
    }

    fn device_file(&self, hash: &str) -> PathBuf {
        self.metadata_dir.join(record_name(hash))
    }

    fn device_set_file(&self) -> PathBuf {
        self.metadata_dir.join(DEVICE_SET_META_FILE)
    }

    fn transaction_file(&self) -> PathBuf {
        self.metadata_dir.join(TRANSACTION_META_FILE)
    }

    /// Write all bytes to a sibling temp file, fsync it, then rename over
    /// the target. A reader never observes a partial target; any error
    /// path removes the temp file.
    fn write_meta_file<S: Serialize>(&self, record: &S, target: &Path) -> ThinsetResult<()> {
        let data = serde_json::to_vec(record)?;
        let mut tmp = Builder::new()
            .prefix(TMP_PREFIX)
            .tempfile_in(&self.metadata_dir)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(target).map_err(|err| err.error)?;
        Ok(())
    }

    /// Read and decode a record; Ok(None) when the target does not exist
    /// yet.
    fn read_meta_file<D: DeserializeOwned>(&self, target: &Path) -> ThinsetResult<Option<D>> {
        let data = match read_to_string(target) {
            Ok(data) => data,
            Err(ref err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&data)?))
    }

    fn remove_meta_file(&self, target: &Path) -> ThinsetResult<()> {
        if let Err(err) = remove_file(target) {
            if err.kind() != ErrorKind::NotFound {
                return Err(err.into());
            }
        }
        Ok(())
    }

    pub fn save_device(&self, hash: &str, save: &DeviceSave) -> ThinsetResult<()> {
        self.write_meta_file(save, &self.device_file(hash))
    }

    pub fn load_device(&self, hash: &str) -> ThinsetResult<Option<DeviceSave>> {
        self.read_meta_file(&self.device_file(hash))
    }

    pub fn remove_device(&self, hash: &str) -> ThinsetResult<()> {
        self.remove_meta_file(&self.device_file(hash))
    }

    pub fn save_device_set(&self, save: &DeviceSetSave) -> ThinsetResult<()> {
        self.write_meta_file(save, &self.device_set_file())
    }

    pub fn load_device_set(&self) -> ThinsetResult<Option<DeviceSetSave>> {
        self.read_meta_file(&self.device_set_file())
    }

    pub fn save_transaction(&self, save: &TransactionSave) -> ThinsetResult<()> {
        self.write_meta_file(save, &self.transaction_file())
    }

    pub fn load_transaction(&self) -> ThinsetResult<Option<TransactionSave>> {
        self.read_meta_file(&self.transaction_file())
    }

    pub fn remove_transaction(&self) -> ThinsetResult<()> {
        self.remove_meta_file(&self.transaction_file())
    }

    /// Load every device record in the store, sorted by file name so the
    /// resulting registry and id bitmap are reproducible.
    pub fn walk_devices(&self) -> ThinsetResult<Vec<(String, DeviceSave)>> {
        let mut names = Vec::new();
        for entry in self.metadata_dir.read_dir()? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue,
            };
            if name == DEVICE_SET_META_FILE
                || name == TRANSACTION_META_FILE
                || name.ends_with(MIGRATED_SUFFIX)
                || name.starts_with(TMP_PREFIX)
            {
                debug!("Skipping file {}", name);
                continue;
            }
            names.push(name);
        }
        names.sort();

        let mut devices = Vec::new();
        for name in names {
            let hash = if name == "base" { String::new() } else { name };
            match self.load_device(&hash)? {
                Some(save) => devices.push((hash, save)),
                None => continue,
            }
        }
        Ok(devices)
    }

    /// Migrate the old aggregate-file format: split it into one file per
    /// device, then rename the source out of the way.
    pub fn migrate_legacy(&self) -> ThinsetResult<()> {
        let legacy: Option<LegacyMetaData> = self.read_meta_file(&self.legacy_file)?;
        if let Some(legacy) = legacy {
            info!(
                "Migrating {} device records from {:?}",
                legacy.devices.len(),
                self.legacy_file
            );
            for (hash, save) in &legacy.devices {
                self.save_device(hash, save)?;
            }
            let mut migrated = self.legacy_file.clone().into_os_string();
            migrated.push(MIGRATED_SUFFIX);
            rename(&self.legacy_file, &migrated)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{create_dir_all, write};

    use tempfile::TempDir;

    use super::*;

    fn store(dir: &TempDir) -> MetadataStore {
        let metadata_dir = dir.path().join("metadata");
        create_dir_all(&metadata_dir).unwrap();
        MetadataStore::new(metadata_dir, dir.path().join("devicemapper").join("json"))
    }

    fn save(id: u32) -> DeviceSave {
        DeviceSave {
            device_id: id,
            size: 1 << 30,
            transaction_id: u64::from(id),
            initialized: false,
        }
    }

    #[test]
    fn test_device_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert_eq!(store.load_device("cafe").unwrap(), None);
        store.save_device("cafe", &save(3)).unwrap();
        assert_eq!(store.load_device("cafe").unwrap(), Some(save(3)));

        // The base device is stored under the name "base".
        store.save_device("", &save(1)).unwrap();
        assert!(store.metadata_dir.join("base").exists());
        assert_eq!(store.load_device("").unwrap(), Some(save(1)));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        for i in 0..10 {
            store.save_device(&format!("dev{}", i), &save(i)).unwrap();
        }
        let leftovers = store
            .metadata_dir
            .read_dir()
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(TMP_PREFIX)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_remove_is_tolerant() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.remove_device("nope").unwrap();
        store.remove_transaction().unwrap();
    }

    #[test]
    fn test_walk_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.save_device("bbb", &save(2)).unwrap();
        store.save_device("", &save(1)).unwrap();
        store.save_device("aaa", &save(3)).unwrap();
        store
            .save_device_set(&DeviceSetSave { next_device_id: 3 })
            .unwrap();
        store
            .save_transaction(&TransactionSave {
                open_transaction_id: 4,
                device_hash: "ccc".into(),
                device_id: 4,
            })
            .unwrap();
        write(store.metadata_dir.join("old.migrated"), b"junk").unwrap();
        write(store.metadata_dir.join(".tmp12345"), b"junk").unwrap();

        let devices = store.walk_devices().unwrap();
        let hashes = devices.iter().map(|(h, _)| h.as_str()).collect::<Vec<_>>();
        assert_eq!(hashes, vec!["aaa", "", "bbb"]);
    }

    #[test]
    fn test_transaction_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.load_transaction().unwrap().is_none());
        store
            .save_transaction(&TransactionSave {
                open_transaction_id: 7,
                device_hash: "cafe".into(),
                device_id: 9,
            })
            .unwrap();
        let loaded = store.load_transaction().unwrap().unwrap();
        assert_eq!(loaded.open_transaction_id, 7);
        assert_eq!(loaded.device_hash, "cafe");
        assert_eq!(loaded.device_id, 9);

        store.remove_transaction().unwrap();
        assert!(store.load_transaction().unwrap().is_none());
    }

    #[test]
    fn test_legacy_migration() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        create_dir_all(dir.path().join("devicemapper")).unwrap();
        write(
            &store.legacy_file,
            serde_json::json!({
                "Devices": {
                    "": {"device_id": 1, "size": 1024, "transaction_id": 1, "initialized": true},
                    "cafe": {"device_id": 2, "size": 1024, "transaction_id": 2, "initialized": false},
                }
            })
            .to_string(),
        )
        .unwrap();

        store.migrate_legacy().unwrap();

        assert!(!store.legacy_file.exists());
        assert!(dir.path().join("devicemapper").join("json.migrated").exists());
        assert_eq!(store.load_device("").unwrap().unwrap().device_id, 1);
        assert_eq!(store.load_device("cafe").unwrap().unwrap().device_id, 2);

        // Running again is a no-op.
        store.migrate_legacy().unwrap();
    }
}
