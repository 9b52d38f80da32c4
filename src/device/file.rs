use super::{check_bounds, Device, DeviceError};
use crate::config::RbmConfig;
use crate::types::DeviceId;
use crate::util::RetryPolicy;
use async_trait::async_trait;
use log::warn;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::task;

const FILE_DEVICE_IO_MAX_ATTEMPTS: usize = 3;
const FILE_DEVICE_IO_BACKOFF: Duration = Duration::from_millis(5);
const ENOSPC: i32 = 28;

/// Device backed by a regular file or block special file.
///
/// The capacity is measured by seeking to the end of the opened handle, which
/// works for block special files whose metadata reports a zero length.
///
/// Blocking std I/O runs on the tokio blocking pool. Transient failures
/// (`Interrupted`, `WouldBlock`, `TimedOut`) are retried under a bounded
/// [`RetryPolicy`]; everything else surfaces to the caller.
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    device_id: DeviceId,
    size: u64,
    read_only: bool,
    retry: RetryPolicy,
    handle: Mutex<Option<Arc<Mutex<File>>>>,
}

impl FileDevice {
    /// Describes an existing file; nothing is touched until [`Device::open`].
    pub fn new(path: impl Into<PathBuf>, device_id: DeviceId, size: u64) -> Self {
        Self {
            path: path.into(),
            device_id,
            size,
            read_only: false,
            retry: RetryPolicy::linear(FILE_DEVICE_IO_MAX_ATTEMPTS, FILE_DEVICE_IO_BACKOFF),
            handle: Mutex::new(None),
        }
    }

    /// Creates (or truncates) the backing file and sizes it to `size` bytes.
    pub fn create(
        path: impl Into<PathBuf>,
        device_id: DeviceId,
        size: u64,
    ) -> Result<Self, DeviceError> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|err| map_io_error(err, &path))?;
        file.set_len(size).map_err(|err| map_io_error(err, &path))?;
        file.sync_all().map_err(|err| map_io_error(err, &path))?;
        Ok(Self::new(path, device_id, size))
    }

    pub fn from_config(config: &RbmConfig) -> Self {
        let device = Self::new(config.path.clone(), config.device_id, config.size);
        match config.io_retry {
            Some(retry) => device.with_retry_policy(retry.policy()),
            None => device,
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&self) -> Result<Arc<Mutex<File>>, DeviceError> {
        self.handle.lock().clone().ok_or(DeviceError::NotOpen)
    }

    async fn run_blocking<T, F>(&self, label: &'static str, op: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnMut(&mut File) -> io::Result<T> + Send + 'static,
    {
        let file = self.file()?;
        let path = self.path.clone();
        let retry = self.retry.clone();
        let mut op = op;
        task::spawn_blocking(move || {
            retry_io(
                &retry,
                || {
                    let mut guard = file.lock();
                    op(&mut *guard)
                },
                label,
                &path,
            )
            .map_err(|err| map_io_error(err, &path))
        })
        .await
        .map_err(map_join_error)?
    }
}

#[async_trait]
impl Device for FileDevice {
    async fn open(&self) -> Result<(), DeviceError> {
        let path = self.path.clone();
        let read_only = self.read_only;
        let (file, actual) = task::spawn_blocking(move || {
            let mut file = OpenOptions::new()
                .read(true)
                .write(!read_only)
                .open(&path)
                .map_err(|err| map_io_error(err, &path))?;
            let len = file
                .seek(SeekFrom::End(0))
                .map_err(|err| map_io_error(err, &path))?;
            Ok::<_, DeviceError>((file, len))
        })
        .await
        .map_err(map_join_error)??;
        if actual < self.size {
            return Err(DeviceError::OutOfRange {
                offset: 0,
                len: self.size,
                size: actual,
            });
        }
        *self.handle.lock() = Some(Arc::new(Mutex::new(file)));
        Ok(())
    }

    async fn close(&self) -> Result<(), DeviceError> {
        self.handle.lock().take();
        Ok(())
    }

    async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        check_bounds(offset, len as u64, self.size)?;
        self.run_blocking("read", move |file| {
            let mut buf = vec![0u8; len];
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf)?;
            Ok(buf)
        })
        .await
    }

    async fn write(&self, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        self.file()?;
        if self.read_only {
            return Err(DeviceError::ReadOnly);
        }
        check_bounds(offset, data.len() as u64, self.size)?;
        let data = data.to_vec();
        self.run_blocking("write", move |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)
        })
        .await
    }

    async fn sync(&self) -> Result<(), DeviceError> {
        self.run_blocking("sync", |file| file.sync_all()).await
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn device_id(&self) -> DeviceId {
        self.device_id
    }
}

fn retry_io<T, F>(policy: &RetryPolicy, mut op: F, label: &str, path: &Path) -> io::Result<T>
where
    F: FnMut() -> io::Result<T>,
{
    let mut retry = policy.handle();
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err) => {
                if let Some(delay) = retry.next_delay() {
                    warn!(
                        "event=rbm_device_io_retry op={} path={} attempt={} error={}",
                        label,
                        path.display(),
                        retry.attempts(),
                        err
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                } else {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

fn should_retry(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn map_io_error(err: io::Error, path: &Path) -> DeviceError {
    if err.raw_os_error() == Some(ENOSPC) {
        return DeviceError::NoSpace;
    }
    match err.kind() {
        io::ErrorKind::NotFound => DeviceError::NotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => DeviceError::ReadOnly,
        _ => DeviceError::Io(err),
    }
}

fn map_join_error(err: task::JoinError) -> DeviceError {
    DeviceError::Io(io::Error::other(format!(
        "file device task cancelled: {err}"
    )))
}
