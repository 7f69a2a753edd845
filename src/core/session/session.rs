use crate::core::bridge::StreamBridge;
use crate::core::copier::{StreamCopier, DEFAULT_BUFFER_SIZE};
use crate::core::lifecycle::{CloseResult, Lifecycle};
use crate::core::stream::{StreamSink, StreamSource};
use crate::domain::error::SerialdResult;
use crate::infrastructure::serial::{Device, DeviceSink, DeviceSource, DeviceState};
use super::state::{PortSnapshot, SessionSnapshot};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, warn};

pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Tuning for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Delay between device health checks
    pub monitor_interval: Duration,
    /// Copy buffer size for both directions
    pub buffer_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

pub struct Session {
    name: String,
    device: Arc<Device>,
    bridge: Arc<StreamBridge>,
    connected_at: DateTime<Utc>,
    monitor_interval: Duration,
}

impl Session {
    /// Bridge `input` into the device and the device into `output`.
    pub fn new(
        name: impl Into<String>,
        device: Arc<Device>,
        input: Box<dyn StreamSource>,
        output: Box<dyn StreamSink>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let name = name.into();
        let span = info_span!("session", name = %name, path = %device.path());

        let inbound = StreamCopier::with_buffer_size(
            input,
            Box::new(DeviceSink::new(Arc::clone(&device))),
            options.buffer_size,
        );
        let outbound = StreamCopier::with_buffer_size(
            Box::new(DeviceSource::new(Arc::clone(&device))),
            output,
            options.buffer_size,
        );
        for copier in [&inbound, &outbound] {
            copier.set_span(info_span!(parent: &span, "copier", stream = %copier.name()));
        }

        let label = format!("{}@{}", name, device.path());
        let bridge = StreamBridge::new(label, vec![inbound, outbound]);
        bridge.set_span(span);

        Arc::new(Self {
            name,
            device,
            bridge,
            connected_at: Utc::now(),
            monitor_interval: options.monitor_interval,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        self.device.path()
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        self.bridge.lifecycle()
    }

    /// Send `data` to the peer ahead of any device output.
    pub async fn send_to_peer(&self, data: &[u8]) -> std::io::Result<()> {
        self.outbound().write_to_sink(data).await
    }

    /// Network to device pump.
    pub fn inbound(&self) -> &Arc<StreamCopier> {
        &self.bridge.copiers()[0]
    }

    /// Device to network pump.
    pub fn outbound(&self) -> &Arc<StreamCopier> {
        &self.bridge.copiers()[1]
    }

    /// Run the bridge to completion while the health monitor watches the
    /// device.
    pub async fn copy(self: &Arc<Self>) -> SerialdResult<()> {
        tokio::spawn(Arc::clone(self).monitor());
        self.bridge.copy().await
    }

    pub async fn close(&self) -> CloseResult {
        self.bridge.close().await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let nonzero = |n: u64| (n > 0).then_some(n);
        SessionSnapshot {
            name: self.name.clone(),
            serial_port: PortSnapshot {
                path: self.device.path().to_string(),
                output: nonzero(self.inbound().written()),
                input: nonzero(self.outbound().written()),
            },
            start_at: self.bridge.started_at().map(DateTime::<Utc>::from),
            connected_at: Some(self.connected_at),
        }
    }

    async fn monitor(self: Arc<Self>) {
        let lifecycle = Arc::clone(self.lifecycle());
        while !lifecycle.is_notified() && !lifecycle.is_closed() {
            let state = self.device.state();
            if state != DeviceState::Ok {
                warn!(session = %self.name, path = %self.device.path(), "port {}.", state);
                if let Err(e) = self.close().await {
                    debug!(session = %self.name, error = %e, "close failed");
                }
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.monitor_interval) => {}
                _ = lifecycle.closed() => return,
            }
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device.path())?;
        if !self.name.is_empty() {
            write!(f, "@{}", self.name)?;
        }
        write!(f, "  {}  {}", self.inbound(), self.outbound())
    }
}
