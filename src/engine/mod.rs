// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    cmd::{FsApi, LinuxFs},
    config::{DeviceSetConfig, FilesystemKind},
    deviceset::{DevStatus, DeviceSet, DiskUsage, Status},
    dm::{DmApi, DmDeviceState, DmStatusLine},
    dm_linux::LinuxDm,
};

mod cmd;
mod config;
mod deviceset;
mod dm;
mod dm_linux;
mod idmap;
mod metadata;
mod names;
mod registry;
mod serde_structs;
pub mod sim;
