// Core module - stream engine, sessions and the server
pub mod bridge;
pub mod copier;
pub mod lifecycle;
pub mod server;
pub mod session;
pub mod starter;
pub mod stream;
