use super::driver::{SerialDriver, SerialHandle};
use crate::domain::error::{SerialdError, SerialdResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Test side of a fake port.
#[derive(Clone)]
pub struct FakePort {
    pub(crate) written: Arc<Mutex<Vec<u8>>>,
    incoming: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
}

impl FakePort {
    /// Make `data` available to the device reader.
    pub fn feed(&self, data: &[u8]) {
        if let Some(tx) = self.incoming.lock().as_ref() {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Bytes written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }
}

struct FakeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(Duration::from_millis(10)) {
                Ok(data) => self.pending = data,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port gone"))
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct FakeWriter {
    written: Arc<Mutex<Vec<u8>>>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Driver over in-memory ports. Device files are up to the caller, since
/// health checks stat the path.
#[derive(Default)]
pub struct FakeDriver {
    ports: Mutex<HashMap<String, FakePort>>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, path: &str) {
        self.ports.lock().insert(
            path.to_string(),
            FakePort {
                written: Arc::new(Mutex::new(Vec::new())),
                incoming: Arc::new(Mutex::new(None)),
            },
        );
    }

    pub fn port(&self, path: &str) -> Option<FakePort> {
        self.ports.lock().get(path).cloned()
    }
}

impl SerialDriver for FakeDriver {
    fn open(&self, path: &str, _baud_rate: u32) -> SerialdResult<SerialHandle> {
        let port = self.port(path).ok_or_else(|| SerialdError::Driver {
            message: format!("no such port: {}", path),
        })?;
        let (tx, rx) = mpsc::channel();
        *port.incoming.lock() = Some(tx);
        Ok(SerialHandle {
            reader: Box::new(FakeReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Box::new(FakeWriter {
                written: Arc::clone(&port.written),
            }),
        })
    }

    fn list_paths(&self) -> SerialdResult<Vec<String>> {
        let mut paths: Vec<String> = self.ports.lock().keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }
}
