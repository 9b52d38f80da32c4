//! Failure taxonomy of the manager, one closed enum per operation family.

use crate::device::DeviceError;
use crate::header::HeaderError;
use std::fmt;
use thiserror::Error;

/// The kind of a failure, independent of the operation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    InvalidArgument,
    NotFound,
    OutOfRange,
    NoSpace,
    BadDescriptor,
    Checksum,
    Version,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Io => "input_output_error",
            ErrorKind::InvalidArgument => "invarg",
            ErrorKind::NotFound => "enoent",
            ErrorKind::OutOfRange => "erange",
            ErrorKind::NoSpace => "enospc",
            ErrorKind::BadDescriptor => "ebadf",
            ErrorKind::Checksum => "checksum_mismatch",
            ErrorKind::Version => "version_mismatch",
        };
        f.write_str(name)
    }
}

impl DeviceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeviceError::Io(_) => ErrorKind::Io,
            DeviceError::NotFound(_) => ErrorKind::NotFound,
            DeviceError::OutOfRange { .. } => ErrorKind::OutOfRange,
            DeviceError::NoSpace => ErrorKind::NoSpace,
            DeviceError::NotOpen | DeviceError::ReadOnly => ErrorKind::BadDescriptor,
        }
    }
}

impl HeaderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeaderError::TooShort { .. } | HeaderError::Malformed(_) => ErrorKind::InvalidArgument,
            HeaderError::UnsupportedVersion { .. } => ErrorKind::Version,
            HeaderError::ChecksumMismatch { .. } => ErrorKind::Checksum,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("I/O error: {0}")]
    Io(#[source] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("range {addr:#x}+{len} is not mapped by the device")]
    NotFound { addr: u64, len: u64 },
    #[error("range {addr:#x}+{len} is outside the data area")]
    OutOfRange { addr: u64, len: u64 },
    #[error("random block manager is not open")]
    NotOpen,
}

impl ReadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReadError::Io(_) => ErrorKind::Io,
            ReadError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ReadError::NotFound { .. } => ErrorKind::NotFound,
            ReadError::OutOfRange { .. } => ErrorKind::OutOfRange,
            ReadError::NotOpen => ErrorKind::BadDescriptor,
        }
    }

    pub(crate) fn from_device(err: DeviceError, addr: u64, len: u64) -> Self {
        match err {
            DeviceError::NotFound(_) => ReadError::NotFound { addr, len },
            DeviceError::OutOfRange { .. } => ReadError::OutOfRange { addr, len },
            DeviceError::NotOpen => ReadError::NotOpen,
            other => ReadError::Io(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[source] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("bad descriptor: {0}")]
    BadDescriptor(String),
    #[error("device reported no space left")]
    NoSpace,
    #[error("range {addr:#x}+{len} is outside the data area")]
    OutOfRange { addr: u64, len: u64 },
}

impl WriteError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WriteError::Io(_) => ErrorKind::Io,
            WriteError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            WriteError::BadDescriptor(_) => ErrorKind::BadDescriptor,
            WriteError::NoSpace => ErrorKind::NoSpace,
            WriteError::OutOfRange { .. } => ErrorKind::OutOfRange,
        }
    }

    pub(crate) fn from_device(err: DeviceError, addr: u64, len: u64) -> Self {
        match err {
            DeviceError::NoSpace => WriteError::NoSpace,
            DeviceError::OutOfRange { .. } => WriteError::OutOfRange { addr, len },
            DeviceError::NotOpen => WriteError::BadDescriptor("device is not open".into()),
            DeviceError::ReadOnly => WriteError::BadDescriptor("device is read-only".into()),
            other => WriteError::Io(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum OpenError {
    #[error("I/O error: {0}")]
    Io(#[source] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Header(#[from] HeaderError),
}

impl OpenError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OpenError::Io(_) => ErrorKind::Io,
            OpenError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            OpenError::NotFound(_) => ErrorKind::NotFound,
            OpenError::Header(err) => err.kind(),
        }
    }
}

impl From<DeviceError> for OpenError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::NotFound(what) => OpenError::NotFound(what),
            other => OpenError::Io(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum CloseError {
    #[error("I/O error: {0}")]
    Io(#[from] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CloseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CloseError::Io(_) => ErrorKind::Io,
            CloseError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocateError {
    #[error("I/O error: {0}")]
    Io(#[from] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no free extent of {requested} bytes (largest free extent {largest} bytes)")]
    NoSpace { requested: u64, largest: u64 },
    #[error("random block manager is not open")]
    NotOpen,
}

impl AllocateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocateError::Io(_) => ErrorKind::Io,
            AllocateError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AllocateError::NoSpace { .. } => ErrorKind::NoSpace,
            AllocateError::NotOpen => ErrorKind::BadDescriptor,
        }
    }
}

#[derive(Debug, Error)]
pub enum FreeExtentError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("range {addr:#x}+{len} is outside the data area")]
    OutOfRange { addr: u64, len: u64 },
    #[error("range {addr:#x}+{len} is not allocated")]
    NotFound { addr: u64, len: u64 },
    #[error("random block manager is not open")]
    NotOpen,
}

impl FreeExtentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FreeExtentError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FreeExtentError::OutOfRange { .. } => ErrorKind::OutOfRange,
            FreeExtentError::NotFound { .. } => ErrorKind::NotFound,
            FreeExtentError::NotOpen => ErrorKind::BadDescriptor,
        }
    }
}

#[derive(Debug, Error)]
pub enum AbortAllocationError {
    #[error("I/O error: {0}")]
    Io(#[from] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("random block manager is not open")]
    NotOpen,
}

impl AbortAllocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AbortAllocationError::Io(_) => ErrorKind::Io,
            AbortAllocationError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AbortAllocationError::NotOpen => ErrorKind::BadDescriptor,
        }
    }
}

#[derive(Debug, Error)]
pub enum CompleteAllocationError {
    #[error("I/O error: {0}")]
    Io(#[from] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("range {addr:#x}+{len} is no longer allocated")]
    NotFound { addr: u64, len: u64 },
    #[error("range {addr:#x}+{len} no longer fits the data area")]
    OutOfRange { addr: u64, len: u64 },
    #[error("random block manager is not open")]
    NotOpen,
}

impl CompleteAllocationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompleteAllocationError::Io(_) => ErrorKind::Io,
            CompleteAllocationError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            CompleteAllocationError::NotFound { .. } => ErrorKind::NotFound,
            CompleteAllocationError::OutOfRange { .. } => ErrorKind::OutOfRange,
            CompleteAllocationError::NotOpen => ErrorKind::BadDescriptor,
        }
    }
}

#[derive(Debug, Error)]
pub enum MkfsError {
    #[error("I/O error: {0}")]
    Io(#[from] DeviceError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MkfsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MkfsError::Io(_) => ErrorKind::Io,
            MkfsError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        }
    }
}
