use crate::domain::error::SerialdResult;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::debug;

/// Independent read and write halves of an open serial port.
///
/// Reads are expected to give up with `TimedOut` (or `WouldBlock`) after a
/// short while when no data arrives, so a closing device is never blocked
/// for long. Dropping both halves closes the port.
pub struct SerialHandle {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

/// Boundary to the platform serial driver.
pub trait SerialDriver: Send + Sync {
    /// Open `path` at `baud_rate`.
    fn open(&self, path: &str, baud_rate: u32) -> SerialdResult<SerialHandle>;

    /// Paths of every serial device currently enumerated.
    fn list_paths(&self) -> SerialdResult<Vec<String>>;
}

/// Driver backed by the `serialport` crate.
#[derive(Debug, Clone)]
pub struct SystemSerialDriver {
    read_timeout: Duration,
}

impl SystemSerialDriver {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SystemSerialDriver {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl SerialDriver for SystemSerialDriver {
    fn open(&self, path: &str, baud_rate: u32) -> SerialdResult<SerialHandle> {
        let port = serialport::new(path, baud_rate)
            .timeout(self.read_timeout)
            .open()?;
        let writer = port.try_clone()?;

        debug!(path = %path, baud_rate, "Serial port opened");

        Ok(SerialHandle {
            reader: Box::new(port),
            writer: Box::new(writer),
        })
    }

    fn list_paths(&self) -> SerialdResult<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}
