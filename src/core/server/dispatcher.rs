use super::protocol::{read_command_line, Command, Reply};
use super::{ConnectionInfo, Server, SessionSlot};
use crate::core::session::Session;
use crate::core::stream::{NamedReader, NamedWriter};
use crate::domain::error::{SerialdError, SerialdResult};
use crate::infrastructure::net::listener::{BoxedReader, BoxedWriter, Connection};
use crate::infrastructure::serial::Device;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

/// Removes the connection from the registry when the handler ends,
/// including on panic.
struct ConnectionGuard<'a> {
    connections: &'a DashMap<String, ConnectionInfo>,
    peer: String,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.connections.remove(&self.peer);
        debug!(peer = %self.peer, "disconnected");
    }
}

/// Holds a device path while an `open` is in progress. Dropped without
/// being committed, it frees the path again.
struct Reservation<'a> {
    sessions: &'a DashMap<String, SessionSlot>,
    path: String,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, session: &Arc<Session>) {
        if let Some(mut slot) = self.sessions.get_mut(&self.path) {
            *slot = SessionSlot::Active(Arc::clone(session));
        }
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.sessions
                .remove_if(&self.path, |_, slot| matches!(slot, SessionSlot::Opening));
        }
    }
}

async fn send(writer: &mut BoxedWriter, reply: Reply) -> io::Result<()> {
    writer.write_all(&reply.encode()).await?;
    writer.flush().await
}

impl Server {
    /// Serve one connection: read commands until `exit`, end of input or an
    /// `open` that hands the connection over to a session.
    pub async fn handle_connection(self: &Arc<Self>, conn: Connection) {
        let Connection {
            peer,
            reader,
            mut writer,
        } = conn;

        self.connections.insert(
            peer.clone(),
            ConnectionInfo {
                peer: peer.clone(),
                connected_at: Utc::now(),
            },
        );
        let _guard = ConnectionGuard {
            connections: &self.connections,
            peer: peer.clone(),
        };
        debug!(peer = %peer, "connected");

        let mut reader = BufReader::new(reader);
        loop {
            let line = match read_command_line(&mut reader, self.options.max_command_len).await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Read command");
                    return;
                }
            };
            debug!(peer = %peer, line = %line, "command");

            let command = match Command::parse(&line) {
                Ok(command) => command,
                Err(e) => {
                    if send(&mut writer, Reply::error(&e)).await.is_err() || e.is_fatal() {
                        return;
                    }
                    continue;
                }
            };

            let reply = match command {
                Command::Open { path, baud_rate } => {
                    self.open(&peer, &path, &baud_rate, reader, writer).await;
                    return;
                }
                Command::Exit => return,
                Command::Info { path } => match self.session(&path) {
                    Some(session) => Reply::value(session.snapshot()),
                    None => Reply::error(SerialdError::NotOpen { path }),
                },
                Command::Close { path } => match self.session(&path) {
                    Some(session) => {
                        if let Err(e) = session.close().await {
                            warn!(peer = %peer, path = %path, error = %e, "close failed");
                        }
                        Reply::value("closed")
                    }
                    None => Reply::error(SerialdError::NotOpen { path }),
                },
                Command::Find { pattern } => {
                    match self.blocking(move |driver| Device::find_path(driver, &pattern)).await {
                        Ok(path) => Reply::value(path),
                        Err(e) => Reply::error(e),
                    }
                }
                Command::Exists { pattern } => {
                    match self.blocking(move |driver| Device::find_path(driver, &pattern)).await {
                        Ok(_) => Reply::value(true),
                        Err(e) if e.is_not_found() => Reply::value(false),
                        Err(e) => Reply::error(e),
                    }
                }
                Command::Ls => Reply::value(self.snapshots()),
            };

            if let Err(e) = send(&mut writer, reply).await {
                debug!(peer = %peer, error = %e, "reply failed");
                return;
            }
        }
    }

    /// Resolve and reserve the device, then bridge it with the connection
    /// until the session closes.
    async fn open(
        self: &Arc<Self>,
        peer: &str,
        pattern: &str,
        baud_rate: &str,
        reader: BufReader<BoxedReader>,
        mut writer: BoxedWriter,
    ) {
        let (device, reservation) = match self.prepare_open(pattern, baud_rate).await {
            Ok(opened) => opened,
            Err(e) => {
                warn!(peer = %peer, path = %pattern, error = %e, "open failed");
                let _ = send(&mut writer, Reply::error(e)).await;
                return;
            }
        };

        let session = Session::new(
            peer,
            Arc::clone(&device),
            Box::new(NamedReader::new(peer, reader)),
            Box::new(NamedWriter::new(peer, writer)),
            self.options.session,
        );
        reservation.commit(&session);

        let weak = Arc::downgrade(self);
        let registered = Arc::downgrade(&session);
        let path = device.path().to_string();
        session.lifecycle().after_close(move || {
            if let Some(server) = weak.upgrade() {
                server.sessions.remove_if(&path, |_, slot| match slot {
                    SessionSlot::Active(s) => std::ptr::eq(Arc::as_ptr(s), registered.as_ptr()),
                    SessionSlot::Opening => false,
                });
                debug!(path = %path, "session unregistered");
            }
        });

        let reply = Reply::value(device.path()).encode();
        if let Err(e) = session.send_to_peer(&reply).await {
            debug!(peer = %peer, error = %e, "reply failed");
            let _ = session.close().await;
            return;
        }

        if self.lifecycle.is_notified() {
            let _ = session.close().await;
        }

        info!(peer = %peer, path = %device.path(), "session opened");
        if let Err(e) = session.copy().await {
            warn!(peer = %peer, path = %device.path(), error = %e, "session failed");
        }
        info!(peer = %peer, path = %device.path(), "session closed");
    }

    async fn prepare_open(
        &self,
        pattern: &str,
        baud_rate: &str,
    ) -> SerialdResult<(Arc<Device>, Reservation<'_>)> {
        let lookup = pattern.to_string();
        let path = self
            .blocking(move |driver| Device::find_path(driver, &lookup))
            .await
            .map_err(|e| match e {
                SerialdError::NotFound => e,
                e => SerialdError::Protocol(format!("Find port failed: {}", e)),
            })?;

        let reservation = match self.sessions.entry(path.clone()) {
            Entry::Occupied(_) => return Err(SerialdError::AlreadyOpen { path }),
            Entry::Vacant(slot) => {
                slot.insert(SessionSlot::Opening);
                Reservation {
                    sessions: &self.sessions,
                    path: path.clone(),
                    committed: false,
                }
            }
        };

        let baud: u32 = baud_rate
            .parse()
            .map_err(|e| SerialdError::Protocol(format!("Parse BaudRate error: {}", e)))?;

        let target = path.clone();
        let device = self
            .blocking(move |driver| Device::open(driver, &target, baud))
            .await
            .map_err(|e| {
                SerialdError::Protocol(format!(
                    "Open SerialPort {:?} with {} Baud Rate failed: {}",
                    path, baud_rate, e
                ))
            })?;

        Ok((device, reservation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::server::ServerOptions;
    use crate::infrastructure::serial::testing::FakeDriver;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio_test::io::Builder;

    type ClientReader = BufReader<ReadHalf<DuplexStream>>;
    type ClientWriter = WriteHalf<DuplexStream>;

    fn server_with(driver: FakeDriver) -> Arc<Server> {
        let mut options = ServerOptions::default();
        options.session.monitor_interval = Duration::from_millis(20);
        options.max_command_len = 64;
        Server::new(Arc::new(driver), options)
    }

    fn fake_port(dir: &TempDir, driver: &FakeDriver, name: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, b"").unwrap();
        let path = path.to_string_lossy().to_string();
        driver.add_port(&path);
        path
    }

    /// Read one pretty-printed reply object.
    async fn read_reply(reader: &mut ClientReader) -> serde_json::Value {
        let mut text = String::new();
        loop {
            let mut line = String::new();
            assert!(reader.read_line(&mut line).await.unwrap() > 0, "connection closed");
            text.push_str(&line);
            if line == "}\n" {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn connect(server: &Arc<Server>, peer: &str) -> (ClientReader, ClientWriter) {
        let (client, remote) = tokio::io::duplex(1024);
        server.spawn_connection(Connection::from_stream(peer, remote));
        let (read, write) = tokio::io::split(client);
        (BufReader::new(read), write)
    }

    #[tokio::test]
    async fn test_ls_on_idle_server() {
        let server = server_with(FakeDriver::new());
        let mock = Builder::new()
            .read(b"ls\n")
            .write(b"{\n  \"Value\": []\n}\n")
            .build();
        server.handle_connection(Connection::from_stream("mock", mock)).await;
        assert!(server.connections().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_commands_keep_the_loop() {
        let server = server_with(FakeDriver::new());
        let mock = Builder::new()
            .read(b"\n")
            .write(b"{\n  \"Error\": \"Invalid command.\"\n}\n")
            .read(b"info\r\n")
            .write(b"{\n  \"Error\": \"Invalid args count. Usage: `info PATH`\"\n}\n")
            .read(b"info /dev/ttyS9\n")
            .write(b"{\n  \"Error\": \"/dev/ttyS9 is not open.\"\n}\n")
            .read(b"exit\n")
            .build();
        server.handle_connection(Connection::from_stream("mock", mock)).await;
    }

    #[tokio::test]
    async fn test_open_usage_error_ends_connection() {
        let server = server_with(FakeDriver::new());
        let mock = Builder::new()
            .read(b"open /dev/ttyS0\n")
            .write(b"{\n  \"Error\": \"Invalid args count. Usage: `open PATH BAUD_RATE`\"\n}\n")
            .build();
        server.handle_connection(Connection::from_stream("mock", mock)).await;
    }

    #[tokio::test]
    async fn test_over_long_command_ends_connection() {
        let server = server_with(FakeDriver::new());
        let line = format!("find {}\n", "x".repeat(100));
        let mock = Builder::new().read(line.as_bytes()).build();
        server.handle_connection(Connection::from_stream("mock", mock)).await;
    }

    #[tokio::test]
    async fn test_find_and_exists_agree() {
        let dir = TempDir::new().unwrap();
        let driver = FakeDriver::new();
        let path = fake_port(&dir, &driver, "ttyUSB3");
        let server = server_with(driver);
        let (mut reader, mut writer) = connect(&server, "client");

        writer.write_all(b"find ~*/ttyUSB*\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await["Value"], path.as_str());
        writer.write_all(b"exists ~*/ttyACM*\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await["Value"], false);
        writer.write_all(b"find ~*/ttyACM*\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await["Error"], "not found");
        writer.write_all(b"exists ~[\n").await.unwrap();
        assert!(read_reply(&mut reader).await["Error"]
            .as_str()
            .unwrap()
            .starts_with("Path expression error"));
    }

    #[tokio::test]
    async fn test_open_missing_path_leaves_no_entry() {
        let server = server_with(FakeDriver::new());
        let (mut reader, mut writer) = connect(&server, "client");

        writer.write_all(b"open /nonexistent/ttyS0 9600\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await["Error"], "not found");
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(server.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_bad_baud_rate_frees_the_path() {
        let dir = TempDir::new().unwrap();
        let driver = FakeDriver::new();
        let path = fake_port(&dir, &driver, "ttyS0");
        let server = server_with(driver);
        let (mut reader, mut writer) = connect(&server, "client");

        writer
            .write_all(format!("open {} fast\n", path).as_bytes())
            .await
            .unwrap();
        let reply = read_reply(&mut reader).await;
        assert!(reply["Error"].as_str().unwrap().starts_with("Parse BaudRate error"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(server.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_open_conflict_and_close() {
        let dir = TempDir::new().unwrap();
        let driver = FakeDriver::new();
        let path = fake_port(&dir, &driver, "ttyUSB0");
        let server = server_with(driver);

        let (mut owner_reader, mut owner_writer) = connect(&server, "owner");
        owner_writer
            .write_all(format!("open {} 115200\n", path).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_reply(&mut owner_reader).await["Value"], path.as_str());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (mut reader, mut writer) = connect(&server, "second");
        writer
            .write_all(format!("open {} 9600\n", path).as_bytes())
            .await
            .unwrap();
        assert_eq!(
            read_reply(&mut reader).await["Error"],
            format!("{} is already open", path).as_str()
        );
        assert!(server.session(&path).is_some());

        let (mut reader, mut writer) = connect(&server, "admin");
        writer.write_all(format!("info {}\n", path).as_bytes()).await.unwrap();
        let info = read_reply(&mut reader).await;
        assert_eq!(info["Value"]["Name"], "owner");
        assert_eq!(info["Value"]["SerialPort"]["Path"], path.as_str());

        writer.write_all(format!("close {}\n", path).as_bytes()).await.unwrap();
        assert_eq!(read_reply(&mut reader).await["Value"], "closed");

        writer.write_all(b"ls\n").await.unwrap();
        assert_eq!(read_reply(&mut reader).await["Value"], serde_json::json!([]));
        writer.write_all(format!("info {}\n", path).as_bytes()).await.unwrap();
        assert!(read_reply(&mut reader).await["Error"].is_string());

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), owner_reader.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_is_registered_when_open_reply_arrives() {
        let dir = TempDir::new().unwrap();
        let driver = FakeDriver::new();
        let path = fake_port(&dir, &driver, "ttyACM2");
        let server = server_with(driver);
        let (mut reader, mut writer) = connect(&server, "owner");

        writer
            .write_all(format!("open {} 9600\n", path).as_bytes())
            .await
            .unwrap();
        assert_eq!(read_reply(&mut reader).await["Value"], path.as_str());

        let session = server.session(&path).expect("registered before the reply");
        assert_eq!(session.name(), "owner");
        assert_eq!(server.snapshots().len(), 1);
    }
}
