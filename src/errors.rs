// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{error::Error, fmt, io};

use devicemapper::DmError;

pub type ThinsetResult<T> = Result<T, ThinsetError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorEnum {
    Error,

    /// The kernel lacks device-mapper or the thin-pool target.
    NotSupported,
    /// The hash has no record in the device set.
    UnknownDevice,
    /// A record for the hash already exists.
    DeviceExists,
    /// The pool already holds a thin device under this id. Handled by
    /// reallocating a fresh id; never surfaced to callers.
    DeviceIdExists,
    /// The 24-bit id space is exhausted.
    NoFreeId,
    /// Resize below the current size was requested.
    ShrinkNotAllowed,
    /// The device is mounted at a different path than requested.
    AlreadyMountedElsewhere,
    /// Unmount was requested with a zero mount count.
    NotMounted,
    /// A bounded-retry wait exhausted its budget.
    Timeout,
    /// Retryable lower-level error; handled by the wait utilities.
    Busy,
    Invalid,
}

impl fmt::Display for ErrorEnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug)]
pub enum ThinsetError {
    Engine(ErrorEnum, String),
    Io(io::Error),
    Nix(nix::Error),
    Serde(serde_json::Error),
    Dm(DmError),
}

impl ThinsetError {
    /// The domain error kind, if this is a domain error.
    pub fn kind(&self) -> Option<ErrorEnum> {
        match *self {
            ThinsetError::Engine(kind, _) => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for ThinsetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ThinsetError::Engine(_, ref msg) => write!(f, "Engine error: {}", msg),
            ThinsetError::Io(ref err) => write!(f, "IO error: {}", err),
            ThinsetError::Nix(ref err) => write!(f, "Nix error: {}", err),
            ThinsetError::Serde(ref err) => write!(f, "Serde error: {}", err),
            ThinsetError::Dm(ref err) => write!(f, "DM error: {}", err),
        }
    }
}

impl Error for ThinsetError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            ThinsetError::Engine(_, _) => None,
            ThinsetError::Io(ref err) => Some(err),
            ThinsetError::Nix(ref err) => Some(err),
            ThinsetError::Serde(ref err) => Some(err),
            ThinsetError::Dm(ref err) => Some(err),
        }
    }
}

impl From<io::Error> for ThinsetError {
    fn from(err: io::Error) -> ThinsetError {
        ThinsetError::Io(err)
    }
}

impl From<nix::Error> for ThinsetError {
    fn from(err: nix::Error) -> ThinsetError {
        ThinsetError::Nix(err)
    }
}

impl From<serde_json::Error> for ThinsetError {
    fn from(err: serde_json::Error) -> ThinsetError {
        ThinsetError::Serde(err)
    }
}

impl From<DmError> for ThinsetError {
    fn from(err: DmError) -> ThinsetError {
        ThinsetError::Dm(err)
    }
}
