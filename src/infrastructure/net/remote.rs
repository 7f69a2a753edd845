use super::listener::{connect, Connection};
use crate::core::bridge::StreamBridge;
use crate::core::copier::StreamCopier;
use crate::core::stream::{NamedReader, NamedWriter};
use crate::domain::error::SerialdResult;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info_span};

/// Connect to `addr` and bridge it with stdin/stdout.
pub async fn run_remote(addr: &str, command: &[String], exit: bool) -> SerialdResult<()> {
    let conn = connect(addr).await?;
    bridge_connection(conn, command, exit, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Send `command` as one line (and `exit` when asked), then copy the
/// connection into `output` and `input` into the connection until either
/// side ends.
pub async fn bridge_connection<I, O>(
    conn: Connection,
    command: &[String],
    exit: bool,
    input: I,
    output: O,
) -> SerialdResult<()>
where
    I: AsyncRead + Unpin + Send + 'static,
    O: AsyncWrite + Unpin + Send + 'static,
{
    let Connection {
        peer,
        reader,
        mut writer,
    } = conn;

    if !command.is_empty() {
        let mut lines = format!("{}\n", command.join(" "));
        if exit {
            lines.push_str("exit\n");
        }
        writer.write_all(lines.as_bytes()).await?;
        writer.flush().await?;
    }

    let span = info_span!("remote", peer = %peer);
    let copiers = vec![
        StreamCopier::new(
            Box::new(NamedReader::new(peer.clone(), reader)),
            Box::new(NamedWriter::new("STDOUT", output)),
        ),
        StreamCopier::new(
            Box::new(NamedReader::new("STDIN", input)),
            Box::new(NamedWriter::new(peer.clone(), writer)),
        ),
    ];
    for copier in &copiers {
        copier.set_span(info_span!(parent: &span, "copier", stream = %copier.name()));
    }

    let bridge = StreamBridge::new(peer, copiers);
    let done = bridge.done_signal();
    bridge.copy().await?;
    let _ = done.await;
    debug!("remote session finished");
    Ok(())
}
