//! Random block manager for a single raw storage device.
//!
//! The crate persists a checksummed metadata header at the start of the
//! device, translates between logical block addresses and device offsets,
//! and hands out block-aligned extents under caller-owned transactions that
//! either complete (persisting the allocation bitmap) or abort.

pub mod addr;
pub mod allocator;
pub mod config;
pub mod device;
pub mod error;
pub mod header;
pub mod manager;
pub mod transaction;
pub mod types;
pub mod util;

pub use addr::{from_absolute, to_absolute};
pub use allocator::{AllocationBitmap, BlockAllocator, FreeExtents, Reservation, ReservationLedger};
pub use config::{ConfigError, FormatOptions, IoRetryConfig, RbmConfig, DEFAULT_BLOCK_SIZE};
pub use device::{Device, DeviceError, DeviceRef, FileDevice, MemoryDevice};
pub use error::{
    AbortAllocationError, AllocateError, CloseError, CompleteAllocationError, ErrorKind,
    FreeExtentError, MkfsError, OpenError, ReadError, WriteError,
};
pub use header::{
    DeviceConfig, DeviceType, HeaderError, RbmMetadataHeader, RBM_DEFAULT_MAGIC,
    RBM_FEATURE_ALLOC_BITMAP, RBM_HEADER_ENCODED_LEN, RBM_HEADER_MAX_LEN, RBM_HEADER_STRUCT_COMPAT,
    RBM_HEADER_STRUCT_V, RBM_MIN_BLOCK_SIZE, RBM_SUPPORTED_FEATURES,
};
pub use manager::{BlockRbManager, Geometry, RandomBlockManager, RandomBlockManagerRef};
pub use transaction::{Transaction, TransactionId};
pub use types::{AbsAddr, BlkNo, BlkPaddr, DeviceId, ExtentLen, Paddr};
pub use util::{RetryPolicy, RetryStrategy};
