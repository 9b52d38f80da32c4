//! The random block manager: lifecycle, block I/O and transactional allocation
//! over a single device.

use crate::addr::{from_absolute, to_absolute};
use crate::allocator::{bitmap_region_len, BlockAllocator};
use crate::config::{FormatOptions, RbmConfig};
use crate::device::{Device, DeviceRef};
use crate::error::{
    AbortAllocationError, AllocateError, CloseError, CompleteAllocationError, FreeExtentError,
    MkfsError, OpenError, ReadError, WriteError,
};
use crate::header::{
    DeviceConfig, RbmMetadataHeader, RBM_DEFAULT_MAGIC, RBM_FEATURE_ALLOC_BITMAP,
    RBM_HEADER_MAX_LEN, RBM_MIN_BLOCK_SIZE, RBM_SUPPORTED_FEATURES,
};
use crate::transaction::Transaction;
use crate::types::{AbsAddr, DeviceId, Paddr};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Block-granular storage over one device.
///
/// Every method takes `&self`; implementations serialize free-space changes
/// internally so one manager can be shared between tasks.
#[async_trait]
pub trait RandomBlockManager: Send + Sync + fmt::Debug {
    async fn open(&self) -> Result<(), OpenError>;

    async fn close(&self) -> Result<(), CloseError>;

    /// Fills `buf` from the block-aligned address `addr`.
    async fn read(&self, addr: &Paddr, buf: &mut [u8]) -> Result<(), ReadError>;

    /// Writes `buf` at the block-aligned address `addr`. Not synced.
    async fn write(&self, addr: &Paddr, buf: &[u8]) -> Result<(), WriteError>;

    /// Reserves at least `size` bytes of contiguous blocks for `t`.
    async fn alloc_extent(&self, t: &Transaction, size: u64) -> Result<Paddr, AllocateError>;

    /// Schedules the allocated extent at `addr` for release when `t` completes.
    async fn free_extent(
        &self,
        t: &Transaction,
        addr: &Paddr,
        len: u64,
    ) -> Result<(), FreeExtentError>;

    async fn abort_allocation(&self, t: &Transaction) -> Result<(), AbortAllocationError>;

    async fn complete_allocation(&self, t: &Transaction) -> Result<(), CompleteAllocationError>;

    /// Device size in bytes, or 0 while closed.
    fn get_size(&self) -> u64;

    fn get_block_size(&self) -> u64;

    /// Free blocks in the data area as of the last completed transaction.
    fn get_free_blocks(&self) -> u64;

    fn get_device_id(&self) -> DeviceId;
}

pub type RandomBlockManagerRef = Box<dyn RandomBlockManager>;

/// Geometry published to the lock-free accessors while open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Geometry {
    pub size: u64,
    pub block_size: u64,
    pub start_data_area: u64,
}

impl Geometry {
    fn from_header(header: &RbmMetadataHeader) -> Self {
        Self {
            size: header.size,
            block_size: header.block_size,
            start_data_area: u64::from(header.start_data_area),
        }
    }
}

#[derive(Debug)]
struct OpenState {
    header: RbmMetadataHeader,
    allocator: Mutex<BlockAllocator>,
}

/// [`RandomBlockManager`] backed by a bitmap allocator on a raw device.
#[derive(Debug)]
pub struct BlockRbManager {
    device: DeviceRef,
    start: u64,
    sync_on_complete: bool,
    state: RwLock<Option<OpenState>>,
    geometry: parking_lot::RwLock<Geometry>,
    free_blocks: AtomicU64,
}

impl BlockRbManager {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            start: 0,
            sync_on_complete: true,
            state: RwLock::new(None),
            geometry: parking_lot::RwLock::new(Geometry::default()),
            free_blocks: AtomicU64::new(0),
        }
    }

    pub fn from_config(device: DeviceRef, config: &RbmConfig) -> Self {
        Self::new(device)
            .with_start(config.start)
            .with_sync_on_complete(config.sync_on_complete)
    }

    /// Offset of the metadata header on the device.
    pub fn with_start(mut self, start: u64) -> Self {
        self.start = start;
        self
    }

    pub fn with_sync_on_complete(mut self, sync_on_complete: bool) -> Self {
        self.sync_on_complete = sync_on_complete;
        self
    }

    pub fn into_ref(self) -> RandomBlockManagerRef {
        Box::new(self)
    }

    pub fn geometry(&self) -> Geometry {
        *self.geometry.read()
    }

    /// Header loaded by the last successful open.
    pub async fn header(&self) -> Option<RbmMetadataHeader> {
        self.state.read().await.as_ref().map(|state| state.header)
    }

    /// Formats `device`: zeroes the allocation bitmap and writes a fresh header.
    pub async fn mkfs(
        device: &dyn Device,
        options: FormatOptions,
    ) -> Result<RbmMetadataHeader, MkfsError> {
        let header = Self::layout(device, &options)?;
        device.open().await?;
        let result = Self::write_layout(device, &header).await;
        let closed = device.close().await;
        result?;
        closed?;
        info!(
            "event=rbm_mkfs device={} size={} block_size={} start={:#x} start_data_area={:#x}",
            header.config.device_id,
            header.size,
            header.block_size,
            header.start,
            header.start_data_area
        );
        Ok(header)
    }

    fn layout(
        device: &dyn Device,
        options: &FormatOptions,
    ) -> Result<RbmMetadataHeader, MkfsError> {
        let block_size = options.block_size;
        if !block_size.is_power_of_two() || block_size < RBM_MIN_BLOCK_SIZE {
            return Err(MkfsError::InvalidArgument(format!(
                "block_size {block_size} must be a power of two of at least {RBM_MIN_BLOCK_SIZE}"
            )));
        }
        if options.start % block_size != 0 || options.size % block_size != 0 {
            return Err(MkfsError::InvalidArgument(format!(
                "start {:#x} and size {} must be multiples of block_size {block_size}",
                options.start, options.size
            )));
        }
        if options.device_id.is_null() {
            return Err(MkfsError::InvalidArgument(format!(
                "{} cannot be formatted",
                options.device_id
            )));
        }
        if options.size > device.size() {
            return Err(MkfsError::InvalidArgument(format!(
                "size {} exceeds device capacity {}",
                options.size,
                device.size()
            )));
        }
        let start_data_area =
            options.start + block_size + bitmap_region_len(options.size, block_size);
        let start_data_area = u32::try_from(start_data_area).map_err(|_| {
            MkfsError::InvalidArgument(format!(
                "data area offset {start_data_area:#x} does not fit the header"
            ))
        })?;
        if options.size <= u64::from(start_data_area) {
            return Err(MkfsError::InvalidArgument(format!(
                "device of {} bytes leaves no data area after {start_data_area:#x}",
                options.size
            )));
        }
        let config = DeviceConfig {
            major_dev: options.major_dev,
            magic: RBM_DEFAULT_MAGIC,
            device_type: options.device_type,
            device_id: options.device_id,
            seastore_id: options.seastore_id,
        };
        Ok(RbmMetadataHeader::new(
            options.size,
            block_size,
            options.start,
            RBM_FEATURE_ALLOC_BITMAP,
            start_data_area,
            config,
        ))
    }

    async fn write_layout(
        device: &dyn Device,
        header: &RbmMetadataHeader,
    ) -> Result<(), MkfsError> {
        let bitmap_start = header.start + header.block_size;
        let bitmap_len = u64::from(header.start_data_area) - bitmap_start;
        device.write(bitmap_start, &vec![0u8; bitmap_len as usize]).await?;
        let mut block = vec![0u8; header.block_size as usize];
        block[..RBM_HEADER_MAX_LEN].copy_from_slice(&header.encode_reserved());
        device.write(header.start, &block).await?;
        device.sync().await?;
        Ok(())
    }

    async fn load(&self) -> Result<OpenState, OpenError> {
        let bytes = self.device.read(self.start, RBM_HEADER_MAX_LEN).await?;
        let header = RbmMetadataHeader::decode(&bytes)?;
        if header.start != self.start {
            return Err(OpenError::InvalidArgument(format!(
                "header records start {:#x}, expected {:#x}",
                header.start, self.start
            )));
        }
        let unsupported = header.feature & !RBM_SUPPORTED_FEATURES;
        if unsupported != 0 {
            return Err(OpenError::InvalidArgument(format!(
                "unsupported feature bits {unsupported:#x}"
            )));
        }
        if header.feature & RBM_FEATURE_ALLOC_BITMAP == 0 {
            return Err(OpenError::InvalidArgument(
                "device carries no allocation bitmap".into(),
            ));
        }
        if header.size > self.device.size() {
            return Err(OpenError::InvalidArgument(format!(
                "header size {} exceeds device capacity {}",
                header.size,
                self.device.size()
            )));
        }
        if header.config.device_id != self.device.device_id() {
            return Err(OpenError::InvalidArgument(format!(
                "header names {}, device is {}",
                header.config.device_id,
                self.device.device_id()
            )));
        }
        let bitmap_end =
            header.start + header.block_size + bitmap_region_len(header.size, header.block_size);
        if u64::from(header.start_data_area) < bitmap_end {
            return Err(OpenError::InvalidArgument(format!(
                "data area at {:#x} overlaps the bitmap ending at {bitmap_end:#x}",
                header.start_data_area
            )));
        }
        let allocator =
            BlockAllocator::load(self.device.as_ref(), &header, self.sync_on_complete).await?;
        Ok(OpenState {
            header,
            allocator: Mutex::new(allocator),
        })
    }

    fn publish(&self, geometry: Geometry, free_blocks: u64) {
        *self.geometry.write() = geometry;
        self.free_blocks.store(free_blocks, Ordering::Release);
    }

    /// Validates `addr`/`len` against the data area and returns the device offset.
    fn data_offset(&self, addr: &Paddr, len: usize) -> Result<AbsAddr, IoCheck> {
        let Some(blk) = addr.try_as_blk_paddr() else {
            return Err(IoCheck::Invalid(format!("{addr} is not a block address")));
        };
        if blk.device_id() != self.device.device_id() {
            return Err(IoCheck::Invalid(format!(
                "{addr} names a device other than {}",
                self.device.device_id()
            )));
        }
        let geometry = self.geometry();
        let offset = to_absolute(addr);
        let len = len as u64;
        if len == 0 || offset % geometry.block_size != 0 || len % geometry.block_size != 0 {
            return Err(IoCheck::Invalid(format!(
                "{offset:#x}+{len} is not aligned to block size {}",
                geometry.block_size
            )));
        }
        match offset.checked_add(len) {
            Some(end) if offset >= geometry.start_data_area && end <= geometry.size => Ok(offset),
            _ => Err(IoCheck::OutOfRange { addr: offset, len }),
        }
    }
}

enum IoCheck {
    Invalid(String),
    OutOfRange { addr: u64, len: u64 },
}

#[async_trait]
impl RandomBlockManager for BlockRbManager {
    async fn open(&self) -> Result<(), OpenError> {
        let mut state = self.state.write().await;
        if state.is_some() {
            return Err(OpenError::InvalidArgument(
                "random block manager is already open".into(),
            ));
        }
        self.device.open().await?;
        let opened = match self.load().await {
            Ok(opened) => opened,
            Err(err) => {
                if let Err(close_err) = self.device.close().await {
                    warn!(
                        "event=rbm_open_cleanup_failed device={} error={}",
                        self.device.device_id(),
                        close_err
                    );
                }
                return Err(err);
            }
        };
        let free_blocks = opened.allocator.lock().await.free_blocks();
        self.publish(Geometry::from_header(&opened.header), free_blocks);
        info!(
            "event=rbm_open device={} size={} block_size={} start_data_area={:#x} free_blocks={}",
            self.device.device_id(),
            opened.header.size,
            opened.header.block_size,
            opened.header.start_data_area,
            free_blocks
        );
        *state = Some(opened);
        Ok(())
    }

    async fn close(&self) -> Result<(), CloseError> {
        let mut state = self.state.write().await;
        if state.is_none() {
            return Err(CloseError::InvalidArgument(
                "random block manager is not open".into(),
            ));
        }
        self.device.sync().await?;
        self.device.close().await?;
        let dropped = match state.take() {
            Some(opened) => {
                let mut allocator = opened.allocator.lock().await;
                let dropped = allocator.ledger().len();
                allocator.clear_reservations();
                dropped
            }
            None => 0,
        };
        self.publish(Geometry::default(), 0);
        info!(
            "event=rbm_close device={} dropped_reservations={}",
            self.device.device_id(),
            dropped
        );
        Ok(())
    }

    async fn read(&self, addr: &Paddr, buf: &mut [u8]) -> Result<(), ReadError> {
        let state = self.state.read().await;
        if state.is_none() {
            return Err(ReadError::NotOpen);
        }
        let offset = self.data_offset(addr, buf.len()).map_err(|check| match check {
            IoCheck::Invalid(reason) => ReadError::InvalidArgument(reason),
            IoCheck::OutOfRange { addr, len } => ReadError::OutOfRange { addr, len },
        })?;
        let len = buf.len() as u64;
        let bytes = self
            .device
            .read(offset, buf.len())
            .await
            .map_err(|err| ReadError::from_device(err, offset, len))?;
        buf.copy_from_slice(&bytes);
        Ok(())
    }

    async fn write(&self, addr: &Paddr, buf: &[u8]) -> Result<(), WriteError> {
        let state = self.state.read().await;
        if state.is_none() {
            return Err(WriteError::BadDescriptor(
                "random block manager is not open".into(),
            ));
        }
        let offset = self.data_offset(addr, buf.len()).map_err(|check| match check {
            IoCheck::Invalid(reason) => WriteError::InvalidArgument(reason),
            IoCheck::OutOfRange { addr, len } => WriteError::OutOfRange { addr, len },
        })?;
        self.device
            .write(offset, buf)
            .await
            .map_err(|err| WriteError::from_device(err, offset, buf.len() as u64))
    }

    async fn alloc_extent(&self, t: &Transaction, size: u64) -> Result<Paddr, AllocateError> {
        let state = self.state.read().await;
        let opened = state.as_ref().ok_or(AllocateError::NotOpen)?;
        let mut allocator = opened.allocator.lock().await;
        let offset = allocator.allocate(t.id(), size)?;
        debug!(
            "event=rbm_alloc_extent txn={} size={} offset={:#x} available_blocks={}",
            t.id(),
            size,
            offset,
            allocator.available_blocks()
        );
        Ok(from_absolute(offset, self.device.device_id()))
    }

    async fn free_extent(
        &self,
        t: &Transaction,
        addr: &Paddr,
        len: u64,
    ) -> Result<(), FreeExtentError> {
        let state = self.state.read().await;
        let opened = state.as_ref().ok_or(FreeExtentError::NotOpen)?;
        let Some(blk) = addr.try_as_blk_paddr() else {
            return Err(FreeExtentError::InvalidArgument(format!(
                "{addr} is not a block address"
            )));
        };
        if blk.device_id() != self.device.device_id() {
            return Err(FreeExtentError::InvalidArgument(format!(
                "{addr} names a device other than {}",
                self.device.device_id()
            )));
        }
        let offset = to_absolute(addr);
        opened.allocator.lock().await.release(t.id(), offset, len)?;
        debug!(
            "event=rbm_free_extent txn={} offset={:#x} len={}",
            t.id(),
            offset,
            len
        );
        Ok(())
    }

    async fn abort_allocation(&self, t: &Transaction) -> Result<(), AbortAllocationError> {
        let state = self.state.read().await;
        let opened = state.as_ref().ok_or(AbortAllocationError::NotOpen)?;
        let returned = opened.allocator.lock().await.abort(t.id())?;
        debug!(
            "event=rbm_abort_allocation txn={} returned_blocks={}",
            t.id(),
            returned
        );
        Ok(())
    }

    async fn complete_allocation(&self, t: &Transaction) -> Result<(), CompleteAllocationError> {
        let state = self.state.read().await;
        let opened = state.as_ref().ok_or(CompleteAllocationError::NotOpen)?;
        let mut allocator = opened.allocator.lock().await;
        let reservation = allocator.complete(self.device.as_ref(), t.id()).await?;
        let free_blocks = allocator.free_blocks();
        self.free_blocks.store(free_blocks, Ordering::Release);
        debug!(
            "event=rbm_complete_allocation txn={} allocated_blocks={} released_blocks={} free_blocks={}",
            t.id(),
            reservation.reserved_blocks(),
            reservation.released_blocks(),
            free_blocks
        );
        Ok(())
    }

    fn get_size(&self) -> u64 {
        self.geometry.read().size
    }

    fn get_block_size(&self) -> u64 {
        self.geometry.read().block_size
    }

    fn get_free_blocks(&self) -> u64 {
        self.free_blocks.load(Ordering::Acquire)
    }

    fn get_device_id(&self) -> DeviceId {
        self.device.device_id()
    }
}
