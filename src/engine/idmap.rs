// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Allocation of thin device ids out of the pool's 24-bit id space.

use devicemapper::ThinDevId;

use crate::errors::{ErrorEnum, ThinsetError, ThinsetResult};

/// Largest id the thin-pool target accepts.
pub const MAX_DEVICE_ID: u32 = 0x00ff_ffff;
const DEVICE_ID_MAP_SIZE: usize = (MAX_DEVICE_ID as usize + 1) / 8;

/// A bitmap over the 24-bit id space with a rotating next-fit cursor.
///
/// The cursor keeps advancing instead of reusing the lowest free id: the
/// pool rejects reuse of an id that an in-flight asynchronous deletion
/// still references, and rotation keeps freshly freed ids out of play for
/// one full revolution.
#[derive(Debug)]
pub struct DeviceIdMap {
    map: Vec<u8>,
    next_device_id: u32,
}

impl DeviceIdMap {
    pub fn new(next_device_id: u32) -> DeviceIdMap {
        DeviceIdMap {
            map: vec![0u8; DEVICE_ID_MAP_SIZE],
            next_device_id: next_device_id & MAX_DEVICE_ID,
        }
    }

    /// The cursor value to persist in the deviceset record.
    pub fn cursor(&self) -> u32 {
        self.next_device_id
    }

    /// Restore the cursor from the persisted deviceset record.
    pub fn set_cursor(&mut self, next_device_id: u32) {
        self.next_device_id = next_device_id & MAX_DEVICE_ID;
    }

    pub fn mark_used(&mut self, id: ThinDevId) {
        let id = u32::from(id);
        self.map[(id / 8) as usize] |= 1 << (id % 8);
    }

    pub fn mark_free(&mut self, id: ThinDevId) {
        let id = u32::from(id);
        self.map[(id / 8) as usize] &= !(1 << (id % 8));
    }

    pub fn is_free(&self, id: ThinDevId) -> bool {
        let id = u32::from(id);
        self.map[(id / 8) as usize] & (1 << (id % 8)) == 0
    }

    fn advance(&mut self) {
        self.next_device_id = (self.next_device_id + 1) & MAX_DEVICE_ID;
    }

    /// Advance the cursor and return the first free id at or after it,
    /// marking it used. Scans the whole id space before giving up.
    pub fn next_free_id(&mut self) -> ThinsetResult<ThinDevId> {
        self.advance();
        for _ in 0..=MAX_DEVICE_ID {
            let id = ThinDevId::new_u64(u64::from(self.next_device_id))?;
            if self.is_free(id) {
                self.mark_used(id);
                return Ok(id);
            }
            self.advance();
        }

        Err(ThinsetError::Engine(
            ErrorEnum::NoFreeId,
            "Unable to find a free device id".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: u32) -> ThinDevId {
        ThinDevId::new_u64(u64::from(value)).unwrap()
    }

    #[test]
    fn test_first_allocation_is_one() {
        let mut map = DeviceIdMap::new(0);
        assert_eq!(map.next_free_id().unwrap(), id(1));
        assert_eq!(map.cursor(), 1);
    }

    #[test]
    fn test_rotation_skips_used() {
        let mut map = DeviceIdMap::new(0);
        map.mark_used(id(1));
        map.mark_used(id(2));
        assert_eq!(map.next_free_id().unwrap(), id(3));
    }

    #[test]
    fn test_free_then_not_immediately_reused() {
        let mut map = DeviceIdMap::new(0);
        let first = map.next_free_id().unwrap();
        let second = map.next_free_id().unwrap();
        map.mark_free(first);
        // The cursor has rotated past the freed id.
        assert_eq!(map.next_free_id().unwrap(), id(3));
        assert!(map.is_free(first));
        assert!(!map.is_free(second));
    }

    #[test]
    fn test_wraparound() {
        let mut map = DeviceIdMap::new(MAX_DEVICE_ID - 1);
        assert_eq!(map.next_free_id().unwrap(), id(MAX_DEVICE_ID));
        assert_eq!(map.next_free_id().unwrap(), id(0));
        assert_eq!(map.cursor(), 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut map = DeviceIdMap::new(0);
        for byte in map.map.iter_mut() {
            *byte = 0xff;
        }
        match map.next_free_id() {
            Err(ThinsetError::Engine(ErrorEnum::NoFreeId, _)) => (),
            other => panic!("expected NoFreeId, got {:?}", other.map(u32::from)),
        }
    }
}
