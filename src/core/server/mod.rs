// Server module - connection registry and accept loop
pub mod dispatcher;
pub mod protocol;

use crate::core::lifecycle::{CloseResult, Lifecycle};
use crate::core::session::{Session, SessionOptions, SessionSnapshot};
use crate::core::starter::Starter;
use crate::domain::config::ServerConfig;
use crate::domain::error::{CloseErrors, SerialdError, SerialdResult};
use crate::infrastructure::net::listener::{remove_socket_file, Connection, Listener};
use crate::infrastructure::serial::SerialDriver;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use protocol::{Command, ParseError, Reply, DEFAULT_MAX_COMMAND_LEN};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Longest command line accepted before the connection is dropped
    pub max_command_len: usize,
    pub session: SessionOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            session: SessionOptions::default(),
        }
    }
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_command_len: config.max_command_len.max(1),
            session: SessionOptions {
                monitor_interval: config.monitor_interval(),
                buffer_size: config.buffer_size.max(1),
            },
        }
    }
}

/// Registry entry for a device path.
pub(crate) enum SessionSlot {
    /// Reserved by an `open` still in progress
    Opening,
    Active(Arc<Session>),
}

/// A live connection, for introspection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConnectionInfo {
    pub peer: String,
    pub connected_at: DateTime<Utc>,
}

pub struct Server {
    driver: Arc<dyn SerialDriver>,
    options: ServerOptions,
    pub(crate) sessions: DashMap<String, SessionSlot>,
    pub(crate) connections: DashMap<String, ConnectionInfo>,
    socket_path: Mutex<Option<PathBuf>>,
    shutdown: CancellationToken,
    lifecycle: Arc<Lifecycle>,
    starter: Starter,
}

impl Server {
    pub fn new(driver: Arc<dyn SerialDriver>, options: ServerOptions) -> Arc<Self> {
        let server = Arc::new(Self {
            driver,
            options,
            sessions: DashMap::new(),
            connections: DashMap::new(),
            socket_path: Mutex::new(None),
            shutdown: CancellationToken::new(),
            lifecycle: Lifecycle::new("server"),
            starter: Starter::new(),
        });

        let shutdown = server.shutdown.clone();
        server.lifecycle.wrap_notify(move || shutdown.cancel());

        let weak = Arc::downgrade(&server);
        server.lifecycle.wrap_close(move || async move {
            let Some(server) = weak.upgrade() else {
                return Ok(());
            };
            server.shutdown.cancel();

            let mut errors = CloseErrors::new();
            for session in server.active_sessions() {
                errors.push(session.path(), session.close().await);
            }
            let socket = server.socket_path.lock().take();
            if let Some(path) = socket {
                remove_socket_file(&path);
            }
            errors.into_result()
        });

        server.starter.on_error(|e| error!(error = %e, "server stopped"));
        server
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Serve `listener` on a background task.
    pub fn start(self: &Arc<Self>, listener: Listener) -> Option<JoinHandle<()>> {
        let weak = Arc::downgrade(self);
        self.starter.set_starter(move || async move {
            match weak.upgrade() {
                Some(server) => server.serve(listener).await,
                None => Ok(()),
            }
        });
        self.starter.start()
    }

    /// Accept connections until the server is notified or closed.
    pub async fn serve(self: &Arc<Self>, listener: Listener) -> SerialdResult<()> {
        if self.lifecycle.is_notified() {
            return Ok(());
        }
        *self.socket_path.lock() = listener.socket_path().map(Path::to_path_buf);
        info!(addr = %listener.local_addr(), "Listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        self.spawn_connection(conn);
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        debug!("accept loop stopped");
        Ok(())
    }

    /// Run the command protocol for `conn` on its own task. A panic in the
    /// handler is logged and stays contained to that connection.
    pub fn spawn_connection(self: &Arc<Self>, conn: Connection) -> JoinHandle<()> {
        let server = Arc::clone(self);
        let peer = conn.peer.clone();
        tokio::spawn(async move {
            let handler = tokio::spawn(async move { server.handle_connection(conn).await });
            if let Err(e) = handler.await {
                if e.is_panic() {
                    let message = panic_message(e.into_panic());
                    error!(peer = %peer, "connection handler panicked: {}", message);
                } else {
                    debug!(peer = %peer, "connection handler cancelled");
                }
            }
        })
    }

    /// Session registered under `path`, if open.
    pub fn session(&self, path: &str) -> Option<Arc<Session>> {
        self.sessions.get(path).and_then(|slot| match slot.value() {
            SessionSlot::Active(session) => Some(Arc::clone(session)),
            SessionSlot::Opening => None,
        })
    }

    /// Open sessions ordered by device path.
    pub fn active_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .filter_map(|entry| match entry.value() {
                SessionSlot::Active(session) => Some(Arc::clone(session)),
                SessionSlot::Opening => None,
            })
            .collect();
        sessions.sort_by(|a, b| a.path().cmp(b.path()));
        sessions
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.active_sessions().iter().map(|s| s.snapshot()).collect()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<_> = self.connections.iter().map(|e| e.value().clone()).collect();
        connections.sort_by(|a, b| a.connected_at.cmp(&b.connected_at));
        connections
    }

    pub fn notify(&self) {
        self.lifecycle.notify();
    }

    pub async fn close(&self) -> CloseResult {
        self.lifecycle.close().await
    }

    /// Run blocking driver work off the async workers.
    pub(crate) async fn blocking<T, F>(&self, work: F) -> SerialdResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SerialDriver) -> SerialdResult<T> + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        tokio::task::spawn_blocking(move || work(driver.as_ref()))
            .await
            .map_err(|e| SerialdError::Driver {
                message: format!("driver task failed: {}", e),
            })?
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
