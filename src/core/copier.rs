use super::lifecycle::{CloseResult, Lifecycle};
use super::starter::Starter;
use super::stream::{StreamSink, StreamSource};
use crate::domain::error::{CloseErrors, SerialdError, SerialdResult};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, Span};

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Copies `source` into `sink` until end of input, an error, or close.
///
/// The copier always closes itself when the pump stops. Errors raised after
/// the copier was notified are the expected fallout of a deliberate close and
/// are dropped. Other errors are logged when a span is attached, otherwise
/// they are returned from [`copy`](Self::copy).
pub struct StreamCopier {
    name: String,
    source: tokio::sync::Mutex<Option<Box<dyn StreamSource>>>,
    sink: tokio::sync::Mutex<Option<Box<dyn StreamSink>>>,
    buffer_size: usize,
    written: AtomicU64,
    started_at: OnceLock<SystemTime>,
    span: Mutex<Option<Span>>,
    stop: CancellationToken,
    lifecycle: Arc<Lifecycle>,
    starter: Starter,
}

impl StreamCopier {
    pub fn new(source: Box<dyn StreamSource>, sink: Box<dyn StreamSink>) -> Arc<Self> {
        Self::with_buffer_size(source, sink, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(
        source: Box<dyn StreamSource>,
        sink: Box<dyn StreamSink>,
        buffer_size: usize,
    ) -> Arc<Self> {
        let name = format!("{} -> {}", source.name(), sink.name());
        let notifiers: Vec<Arc<Lifecycle>> = [source.close_notifier(), sink.close_notifier()]
            .into_iter()
            .flatten()
            .collect();

        let copier = Arc::new(Self {
            lifecycle: Lifecycle::new(name.clone()),
            name,
            source: tokio::sync::Mutex::new(Some(source)),
            sink: tokio::sync::Mutex::new(Some(sink)),
            buffer_size: buffer_size.max(1),
            written: AtomicU64::new(0),
            started_at: OnceLock::new(),
            span: Mutex::new(None),
            stop: CancellationToken::new(),
            starter: Starter::new(),
        });

        copier.lifecycle.on_notify(move || {
            for notifier in notifiers {
                notifier.notify();
            }
        });

        let weak = Arc::downgrade(&copier);
        copier.lifecycle.wrap_close(move || async move {
            match weak.upgrade() {
                Some(copier) => copier.close_endpoints().await,
                None => Ok(()),
            }
        });

        let weak = Arc::downgrade(&copier);
        copier.starter.set_starter(move || async move {
            match weak.upgrade() {
                Some(copier) => copier.copy().await,
                None => Ok(()),
            }
        });

        copier
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes delivered to the sink so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at.get().copied()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Attach a logging span; errors are then logged instead of returned.
    pub fn set_span(&self, span: Span) {
        *self.span.lock() = Some(span);
    }

    pub fn has_span(&self) -> bool {
        self.span.lock().is_some()
    }

    /// Write straight to the sink, outside the pump and its byte counter.
    pub async fn write_to_sink(&self, data: &[u8]) -> io::Result<()> {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink.write_all(data).await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "sink closed")),
        }
    }

    pub fn on_error(&self, observer: impl Fn(&SerialdError) + Send + Sync + 'static) {
        self.starter.on_error(observer);
    }

    /// Run [`copy`](Self::copy) in the background.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.starter.start()
    }

    pub fn notify(&self) {
        self.lifecycle.notify();
    }

    pub async fn close(&self) -> CloseResult {
        self.lifecycle.close().await
    }

    pub async fn copy(&self) -> SerialdResult<()> {
        let _ = self.started_at.set(SystemTime::now());
        let result = self.pump().await;
        let expected = self.lifecycle.is_notified();

        if let Err(e) = self.lifecycle.close().await {
            debug!(copier = %self.name, error = %e, "close failed");
        }

        let span = self.span.lock().clone();
        match result {
            Ok(()) => {
                if let Some(span) = span {
                    span.in_scope(|| debug!(written = self.written(), "Done"));
                }
                Ok(())
            }
            Err(_) if expected => Ok(()),
            Err(e) => match span {
                Some(span) => {
                    span.in_scope(|| error!(error = %e, "done with error"));
                    Ok(())
                }
                None => Err(e.into()),
            },
        }
    }

    async fn pump(&self) -> io::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = {
                let mut guard = self.source.lock().await;
                let Some(source) = guard.as_mut() else {
                    return Ok(());
                };
                tokio::select! {
                    _ = self.stop.cancelled() => return Ok(()),
                    read = source.read(&mut buf) => read?,
                }
            };
            if n == 0 {
                return Ok(());
            }

            {
                let mut guard = self.sink.lock().await;
                let Some(sink) = guard.as_mut() else {
                    return Ok(());
                };
                tokio::select! {
                    _ = self.stop.cancelled() => return Ok(()),
                    written = sink.write_all(&buf[..n]) => written?,
                }
            }

            self.written.fetch_add(n as u64, Ordering::Relaxed);
            trace!(copier = %self.name, bytes = n, data = %hex::encode(&buf[..n]), "copied");
        }
    }

    async fn close_endpoints(&self) -> CloseResult {
        self.stop.cancel();

        let mut errors = CloseErrors::new();
        let source = self.source.lock().await.take();
        if let Some(mut source) = source {
            errors.push("SRC", source.close().await);
        }
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            errors.push("DST", sink.close().await);
        }
        errors.into_result()
    }
}

impl fmt::Display for StreamCopier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(started) = self.started_at() {
            let uptime = started.elapsed().unwrap_or_default();
            write!(f, " uptime='{:.1?}'", uptime)?;
            if let Some(end) = self.lifecycle.closed_at() {
                write!(f, " end_at='{}'", chrono::DateTime::<chrono::Utc>::from(end).to_rfc3339())?;
            }
        }
        let written = self.written();
        if written != 0 {
            write!(f, " written={}", written)?;
        }
        Ok(())
    }
}
