use super::lifecycle::Lifecycle;
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Readable end of a copy pump.
#[async_trait]
pub trait StreamSource: Send {
    fn name(&self) -> String;

    /// Read into `buf`; `Ok(0)` means end of input.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    async fn close(&mut self) -> io::Result<()>;

    /// Lifecycle to notify when the owning copier begins an expected
    /// shutdown, for endpoints that are themselves closable resources.
    fn close_notifier(&self) -> Option<Arc<Lifecycle>> {
        None
    }
}

/// Writable end of a copy pump.
#[async_trait]
pub trait StreamSink: Send {
    fn name(&self) -> String;

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn close(&mut self) -> io::Result<()>;

    fn close_notifier(&self) -> Option<Arc<Lifecycle>> {
        None
    }
}

/// Any async reader under a display name. Closing drops the reader.
pub struct NamedReader<R> {
    name: String,
    inner: Option<R>,
}

impl<R> NamedReader<R> {
    pub fn new(name: impl Into<String>, inner: R) -> Self {
        Self {
            name: name.into(),
            inner: Some(inner),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> StreamSource for NamedReader<R> {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(reader) => reader.read(buf).await,
            None => Ok(0),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.take();
        Ok(())
    }
}

/// Any async writer under a display name. Closing shuts the writer down.
pub struct NamedWriter<W> {
    name: String,
    inner: Option<W>,
}

impl<W> NamedWriter<W> {
    pub fn new(name: impl Into<String>, inner: W) -> Self {
        Self {
            name: name.into(),
            inner: Some(inner),
        }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> StreamSink for NamedWriter<W> {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(writer) => {
                writer.write_all(buf).await?;
                writer.flush().await
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed")),
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.inner.take() {
            Some(mut writer) => match writer.shutdown().await {
                // The peer may already be gone.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
                other => other,
            },
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_named_reader_reports_eof_after_close() {
        let mut reader = NamedReader::new("input", &b"abc"[..]);
        assert_eq!(reader.name(), "input");

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 3);
        reader.close().await.unwrap();
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_named_writer_rejects_writes_after_close() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut writer = NamedWriter::new("output", a);

        writer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        writer.close().await.unwrap();
        assert!(writer.write_all(b"x").await.is_err());
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
