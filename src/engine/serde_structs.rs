// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// The on-disk metadata format is JSON via serde-rs. The in-memory types
// carry runtime-only state (locks, mount counts) that has no business on
// disk, so the persisted slice of each of them lives in a *Save struct
// holding only serde-friendly data, converted to and from at the store
// boundary.

use std::collections::HashMap;

/// The persisted slice of a device record. The hash is implicit in the
/// file name and not stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSave {
    pub device_id: u32,
    pub size: u64,
    pub transaction_id: u64,
    pub initialized: bool,
}

/// The persisted slice of the device set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSetSave {
    pub next_device_id: u32,
}

/// The single-slot pending-transaction record. At most one exists on disk
/// at any time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionSave {
    pub open_transaction_id: u64,
    pub device_hash: String,
    pub device_id: u32,
}

/// The legacy aggregate metadata file: every device record in one JSON
/// document, keyed by hash.
#[derive(Debug, Deserialize)]
pub struct LegacyMetaData {
    #[serde(rename = "Devices")]
    pub devices: HashMap<String, DeviceSave>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_save_field_names() {
        let save = DeviceSave {
            device_id: 7,
            size: 1024,
            transaction_id: 3,
            initialized: true,
        };
        let json = serde_json::to_value(&save).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "device_id": 7,
                "size": 1024,
                "transaction_id": 3,
                "initialized": true
            })
        );
    }

    #[test]
    fn test_transaction_save_field_names() {
        let save = TransactionSave {
            open_transaction_id: 4,
            device_hash: "cafe".into(),
            device_id: 5,
        };
        let json = serde_json::to_value(&save).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "open_transaction_id": 4,
                "device_hash": "cafe",
                "device_id": 5
            })
        );
    }
}
