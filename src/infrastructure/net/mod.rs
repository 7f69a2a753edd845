// Network module - listeners and the remote client
pub mod listener;
pub mod remote;

pub use listener::{connect, Connection, Listener};
pub use remote::{bridge_connection, run_remote};
