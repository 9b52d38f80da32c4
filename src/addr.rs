//! Translation between logical block addresses and absolute device offsets.

use crate::types::{AbsAddr, DeviceId, Paddr};

/// Extracts the device-relative byte offset of a block address.
///
/// # Panics
///
/// If `paddr` is not a block address.
#[inline]
pub fn to_absolute(paddr: &Paddr) -> AbsAddr {
    paddr.as_blk_paddr().device_off()
}

/// Tags an absolute offset with its device identity.
#[inline]
pub fn from_absolute(addr: AbsAddr, device_id: DeviceId) -> Paddr {
    Paddr::make_blk_paddr(device_id, addr)
}
