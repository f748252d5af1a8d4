//! IPC client used by the CLI commands

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::ipc::protocol::{parse_reply, serialize_command, Command, Reply};

/// Send one command to a running daemon and wait for its reply
pub async fn send_command(socket_path: &Path, command: &Command) -> Result<Reply> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to {} (is the daemon running?)", socket_path.display()))?;
    let (reader, mut writer) = stream.into_split();

    let json = serialize_command(command).context("Failed to serialize command")?;
    writer.write_all(&json).await.context("Failed to send command")?;

    let mut line = String::new();
    let read = BufReader::new(reader)
        .read_line(&mut line)
        .await
        .context("Failed to read reply")?;
    if read == 0 {
        return Err(anyhow!("Daemon closed the connection without replying"));
    }

    parse_reply(line.trim().as_bytes()).context("Invalid reply from daemon")
}
