use super::driver::SerialDriver;
use crate::core::lifecycle::{CloseResult, Lifecycle};
use crate::core::stream::{StreamSink, StreamSource};
use crate::domain::error::{SerialdError, SerialdResult};
use async_trait::async_trait;
use globset::Glob;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::fs::{self, Metadata};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Marker that turns a path argument into a glob over enumerated devices.
pub const PATTERN_MARKER: char = '~';

/// Liveness of a device derived from its filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Ok,
    Changed,
    Removed,
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Ok => write!(f, "ok"),
            DeviceState::Changed => write!(f, "changed"),
            DeviceState::Removed => write!(f, "removed"),
            DeviceState::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    #[cfg(not(unix))]
    fn of(meta: &Metadata) -> Self {
        let ino = meta
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self { dev: meta.len(), ino }
    }
}

fn stat(path: &str) -> SerialdResult<Metadata> {
    fs::metadata(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SerialdError::NotFound,
        _ => SerialdError::Io(e),
    })
}

/// An open serial port.
///
/// Reads and writes are blocking and meant to run on the blocking pool; use
/// [`DeviceSource`] and [`DeviceSink`] to plug a device into a copier.
pub struct Device {
    path: String,
    identity: FileIdentity,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    read_count: AtomicU64,
    write_count: AtomicU64,
    lifecycle: Arc<Lifecycle>,
}

impl Device {
    /// Open `path` through `driver`, capturing the identity of the file.
    pub fn open(driver: &dyn SerialDriver, path: &str, baud_rate: u32) -> SerialdResult<Arc<Self>> {
        let identity = FileIdentity::of(&stat(path)?);
        let handle = driver.open(path, baud_rate)?;

        let device = Arc::new(Self {
            path: path.to_string(),
            identity,
            reader: Mutex::new(Some(handle.reader)),
            writer: Mutex::new(Some(handle.writer)),
            read_count: AtomicU64::new(0),
            write_count: AtomicU64::new(0),
            lifecycle: Lifecycle::new(path),
        });

        let weak = Arc::downgrade(&device);
        device.lifecycle.wrap_close(move || async move {
            if let Some(device) = weak.upgrade() {
                device.release();
            }
            Ok(())
        });

        Ok(device)
    }

    /// Resolve a literal path or a `~glob` pattern to an existing device.
    pub fn find_path(driver: &dyn SerialDriver, pattern: &str) -> SerialdResult<String> {
        if let Some(expr) = pattern.strip_prefix(PATTERN_MARKER) {
            let matcher = Glob::new(expr)
                .map_err(|e| SerialdError::Protocol(format!("Path expression error: {}", e)))?
                .compile_matcher();
            let paths = driver.list_paths().map_err(|e| SerialdError::Driver {
                message: format!("Get ports list failed: {}", e),
            })?;
            return paths
                .into_iter()
                .find(|p| matcher.is_match(p))
                .ok_or(SerialdError::NotFound);
        }

        stat(pattern)?;
        Ok(pattern.to_string())
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn read_count(&self) -> u64 {
        self.read_count.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Relaxed)
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_closed()
    }

    /// Re-stat the path and compare it with the file opened.
    pub fn state(&self) -> DeviceState {
        match fs::metadata(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => DeviceState::Removed,
            Err(_) => DeviceState::Error,
            Ok(meta) if FileIdentity::of(&meta) == self.identity => DeviceState::Ok,
            Ok(_) => DeviceState::Changed,
        }
    }

    /// Blocking read. `Ok(0)` once the device is closed.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut guard = self.reader.lock();
        let Some(reader) = guard.as_mut() else {
            return Ok(0);
        };
        let result = reader.read(buf);
        if self.is_closed() {
            // Closed while this read was in flight.
            guard.take();
        }
        let n = result?;
        self.read_count.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Blocking write of the whole buffer.
    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device closed"));
        };
        let mut result = Ok(());
        let mut rest = buf;
        while !rest.is_empty() {
            match writer.write(rest) {
                Ok(0) => {
                    result = Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "device accepted no data",
                    ));
                    break;
                }
                Ok(n) => {
                    self.write_count.fetch_add(n as u64, Ordering::Relaxed);
                    rest = &rest[n..];
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if result.is_ok() {
            result = writer.flush();
        }
        if self.is_closed() {
            guard.take();
        }
        result
    }

    pub async fn close(&self) -> CloseResult {
        self.lifecycle.close().await
    }

    // Handles busy in a blocking call are dropped by that call on return.
    fn release(&self) {
        if let Some(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Some(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

fn join_error(e: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Reading half of a device, for use as a copier source.
pub struct DeviceSource {
    device: Arc<Device>,
}

impl DeviceSource {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl StreamSource for DeviceSource {
    fn name(&self) -> String {
        self.device.path().to_string()
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let device = Arc::clone(&self.device);
            let len = buf.len();
            let result = tokio::task::spawn_blocking(move || {
                let mut chunk = vec![0u8; len];
                device.read(&mut chunk).map(|n| {
                    chunk.truncate(n);
                    chunk
                })
            })
            .await
            .map_err(join_error)?;

            match result {
                Ok(chunk) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    return Ok(chunk.len());
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    if self.device.is_closed() {
                        return Ok(0);
                    }
                }
                Err(_) if self.device.lifecycle().is_notified() => return Ok(0),
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.device
            .close()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn close_notifier(&self) -> Option<Arc<Lifecycle>> {
        Some(Arc::clone(self.device.lifecycle()))
    }
}

/// Writing half of a device, for use as a copier sink.
pub struct DeviceSink {
    device: Arc<Device>,
}

impl DeviceSink {
    pub fn new(device: Arc<Device>) -> Self {
        Self { device }
    }
}

#[async_trait]
impl StreamSink for DeviceSink {
    fn name(&self) -> String {
        self.device.path().to_string()
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let device = Arc::clone(&self.device);
        let data = buf.to_vec();
        tokio::task::spawn_blocking(move || device.write(&data))
            .await
            .map_err(join_error)?
    }

    async fn close(&mut self) -> io::Result<()> {
        self.device
            .close()
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn close_notifier(&self) -> Option<Arc<Lifecycle>> {
        Some(Arc::clone(self.device.lifecycle()))
    }
}
