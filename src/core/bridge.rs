use super::copier::StreamCopier;
use super::lifecycle::{CloseResult, Lifecycle};
use super::starter::Starter;
use crate::domain::error::{CloseErrors, SerialdError, SerialdResult};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, Span};

/// Duplex pipe made of independent copy pumps.
///
/// The first member to finish closes the bridge, which notifies every
/// member and then closes them, so one side ending tears down the other.
pub struct StreamBridge {
    name: String,
    copiers: Vec<Arc<StreamCopier>>,
    started_at: OnceLock<SystemTime>,
    span: Mutex<Option<Span>>,
    done: Mutex<Option<oneshot::Sender<bool>>>,
    lifecycle: Arc<Lifecycle>,
    starter: Starter,
}

impl StreamBridge {
    pub fn new(name: impl Into<String>, copiers: Vec<Arc<StreamCopier>>) -> Arc<Self> {
        let name = name.into();
        let bridge = Arc::new(Self {
            lifecycle: Lifecycle::new(name.clone()),
            name,
            copiers,
            started_at: OnceLock::new(),
            span: Mutex::new(None),
            done: Mutex::new(None),
            starter: Starter::new(),
        });

        let members = bridge.copiers.clone();
        bridge.lifecycle.on_notify(move || {
            for copier in &members {
                copier.notify();
            }
        });

        let members = bridge.copiers.clone();
        bridge.lifecycle.wrap_close(move || async move {
            let mut errors = CloseErrors::new();
            for (i, copier) in members.iter().enumerate() {
                errors.push(format!("Closer #{} failed", i), copier.close().await);
            }
            errors.into_result()
        });

        let weak = Arc::downgrade(&bridge);
        bridge.starter.set_starter(move || async move {
            match weak.upgrade() {
                Some(bridge) => bridge.copy().await,
                None => Ok(()),
            }
        });

        bridge
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn copiers(&self) -> &[Arc<StreamCopier>] {
        &self.copiers
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at.get().copied()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Default span for members that have none of their own.
    pub fn set_span(&self, span: Span) {
        *self.span.lock() = Some(span);
    }

    /// Completion signal, fulfilled with `true` once every member finished.
    pub fn done_signal(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        *self.done.lock() = Some(tx);
        rx
    }

    pub fn on_error(&self, observer: impl Fn(&SerialdError) + Send + Sync + 'static) {
        self.starter.on_error(observer);
    }

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
        let started = SystemTime::now();
        let _ = self.started_at.set(started);
        let span = self.span.lock().clone();

        let (tx, mut rx) = mpsc::unbounded_channel::<usize>();
        for (i, copier) in self.copiers.iter().enumerate() {
            if let Some(span) = &span {
                if !copier.has_span() {
                    copier.set_span(span.clone());
                }
            }
            let tx = tx.clone();
            copier.lifecycle().after_close(move || {
                let _ = tx.send(i);
            });
            copier.start();
        }
        drop(tx);

        let mut remaining = self.copiers.len();
        let mut cascaded = false;
        while remaining > 0 {
            let Some(i) = rx.recv().await else {
                break;
            };
            remaining -= 1;
            debug!(bridge = %self.name, copier = i, "member closed");
            if !cascaded {
                cascaded = true;
                if let Err(e) = self.lifecycle.close().await {
                    debug!(bridge = %self.name, error = %e, "close failed");
                }
            }
        }

        debug!(
            bridge = %self.name,
            "Closed after {:.1?}.",
            started.elapsed().unwrap_or_default()
        );

        if let Some(done) = self.done.lock().take() {
            let _ = done.send(true);
        }

        if let Err(e) = self.lifecycle.close().await {
            debug!(bridge = %self.name, error = %e, "close failed");
        }
        Ok(())
    }
}
