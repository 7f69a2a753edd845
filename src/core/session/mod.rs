// Session module - device to peer bindings
pub mod session;
pub mod state;

pub use session::{Session, SessionOptions, DEFAULT_MONITOR_INTERVAL};
pub use state::{PortSnapshot, SessionSnapshot};
