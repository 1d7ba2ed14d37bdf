// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Management of thin-provisioned copy-on-write volumes on a device-mapper
//! thin-pool.
//!
//! The central type is [`DeviceSet`]: it discovers or creates a thin-pool
//! for a given root directory, carves per-hash thin devices out of it, and
//! keeps crash-safe JSON metadata about every device alongside a single-slot
//! transaction log paired with the pool's own transaction id.
//!
//! [`DeviceSet`]: engine::DeviceSet

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde_derive;

pub mod engine;
mod errors;

pub use crate::{
    engine::{DevStatus, DeviceSet, DeviceSetConfig, Status},
    errors::{ErrorEnum, ThinsetError, ThinsetResult},
};
