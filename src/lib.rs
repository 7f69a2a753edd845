//! seriald library
//!
//! Serves the serial devices of a machine over TCP or unix sockets: a line
//! command protocol on each connection, then a raw duplex byte pipe between
//! the peer and the opened device.

pub mod cli;
pub mod core;
pub mod domain;
pub mod infrastructure;

pub use domain::error::{CloseErrors, SerialdError, SerialdResult};
pub use domain::config::SerialdConfig;
pub use core::bridge::StreamBridge;
pub use core::copier::StreamCopier;
pub use core::lifecycle::Lifecycle;
pub use core::server::{Server, ServerOptions};
pub use core::session::{Session, SessionOptions, SessionSnapshot};
pub use infrastructure::net::{Connection, Listener};
pub use infrastructure::serial::{
    Device, DeviceState, SerialDriver, SerialHandle, SystemSerialDriver,
};
