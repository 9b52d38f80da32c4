//! Core identity and addressing types shared by every layer of the manager.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Absolute byte offset within one device.
pub type AbsAddr = u64;
/// Length of an extent in bytes.
pub type ExtentLen = u32;
/// Block number relative to the start of the device.
pub type BlkNo = u64;

/// Identifies a physical device among the devices of one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u8);

impl DeviceId {
    /// Reserved id that never names a real device.
    pub const NULL: DeviceId = DeviceId(u8::MAX);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("dev:null")
        } else {
            write!(f, "dev:{}", self.0)
        }
    }
}

/// Block-device address: a device id plus a byte offset into that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlkPaddr {
    device_id: DeviceId,
    device_off: AbsAddr,
}

impl BlkPaddr {
    pub fn new(device_id: DeviceId, device_off: AbsAddr) -> Self {
        Self {
            device_id,
            device_off,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn device_off(&self) -> AbsAddr {
        self.device_off
    }
}

/// Logical address in the store's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Paddr {
    Blk(BlkPaddr),
    Null,
}

impl Paddr {
    pub fn make_blk_paddr(device_id: DeviceId, device_off: AbsAddr) -> Self {
        Paddr::Blk(BlkPaddr::new(device_id, device_off))
    }

    pub fn try_as_blk_paddr(&self) -> Option<&BlkPaddr> {
        match self {
            Paddr::Blk(blk) => Some(blk),
            Paddr::Null => None,
        }
    }

    /// # Panics
    ///
    /// If the address is not a block address. Callers hand this backend block addresses only.
    pub fn as_blk_paddr(&self) -> &BlkPaddr {
        match self {
            Paddr::Blk(blk) => blk,
            other => panic!("paddr {other} is not a block address"),
        }
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Paddr::Blk(blk) => write!(f, "paddr<{}, {:#x}>", blk.device_id, blk.device_off),
            Paddr::Null => f.write_str("paddr<null>"),
        }
    }
}
