//! IPC Server - Unix socket server for local clients
//!
//! Handles incoming connections and dispatches commands to the agent host
//! and the cache coordinator.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::coordinator::{CacheCoordinator, CacheStatus};
use crate::host::AgentHost;
use crate::ipc::protocol::{parse_command, serialize_reply, Command, Reply, PROTOCOL_VERSION};
use crate::origin::ResourceRequest;

/// IPC Server that listens for commands from local clients
pub struct IpcServer {
    /// Host routing fetches to the controlling agent
    host: Arc<AgentHost>,
    /// Coordinator for status, updates and cache clearing
    coordinator: Arc<CacheCoordinator>,
    /// Socket file path
    socket_path: PathBuf,
    /// Socket listener
    listener: Option<UnixListener>,
    /// Active connections counter
    connection_count: Arc<RwLock<u32>>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(
        host: Arc<AgentHost>,
        coordinator: Arc<CacheCoordinator>,
        socket_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host,
            coordinator,
            socket_path: socket_path.into(),
            listener: None,
            connection_count: Arc::new(RwLock::new(0)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket, replacing a stale socket file
    pub async fn start(&mut self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove existing socket file")?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind Unix socket {}", self.socket_path.display()))?;

        info!(
            socket_path = %self.socket_path.display(),
            protocol_version = PROTOCOL_VERSION,
            "IPC server started"
        );

        self.listener = Some(listener);
        Ok(())
    }

    /// Run the server loop, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref()
            .context("Server not started")?;

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let host = Arc::clone(&self.host);
                    let coordinator = Arc::clone(&self.coordinator);
                    let connection_count = Arc::clone(&self.connection_count);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, host, coordinator, connection_count).await {
                            error!(error = %e, "Connection handler error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    /// Remove the socket file
    pub async fn stop(&self) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .context("Failed to remove socket file")?;
        }
        info!("IPC server stopped");
        Ok(())
    }

    /// Get the number of active connections
    pub async fn connection_count(&self) -> u32 {
        *self.connection_count.read().await
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    host: Arc<AgentHost>,
    coordinator: Arc<CacheCoordinator>,
    connection_count: Arc<RwLock<u32>>,
) -> Result<()> {
    {
        let mut count = connection_count.write().await;
        *count += 1;
        debug!(count = *count, "New connection");
    }

    let (reader, mut writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    // Newline-delimited JSON, one reply per command
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("Connection closed by client");
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                debug!(command = %trimmed, "Received command");

                let reply = match parse_command(trimmed.as_bytes()) {
                    Ok(command) => process_command(command, &host, &coordinator).await,
                    Err(e) => {
                        error!(error = %e, command = %trimmed, "Failed to parse command");
                        Reply::Error {
                            error: format!("Invalid command: {}", e),
                        }
                    }
                };

                match serialize_reply(&reply) {
                    Ok(json) => {
                        if let Err(e) = writer.write_all(&json).await {
                            error!(error = %e, "Failed to write reply");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to serialize reply");
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to read from socket");
                break;
            }
        }
    }

    {
        let mut count = connection_count.write().await;
        *count = count.saturating_sub(1);
        debug!(count = *count, "Connection ended");
    }

    Ok(())
}

/// Process a command and return a reply
async fn process_command(
    command: Command,
    host: &AgentHost,
    coordinator: &CacheCoordinator,
) -> Reply {
    match command {
        Command::Fetch { method, url } => {
            let request = match ResourceRequest::parse(&method, &url) {
                Ok(request) => request,
                Err(e) => return Reply::Error { error: e.to_string() },
            };
            debug!(method = %request.method, url = %request.url, "Processing fetch command");
            Reply::from_outcome(host.handle_fetch(request).await)
        }

        Command::ForceActivate => {
            info!("Processing force-activate command");
            if coordinator.apply_update().await {
                Reply::Success {
                    message: Some("Waiting agent activated".to_string()),
                }
            } else {
                Reply::Error {
                    error: "No update is waiting".to_string(),
                }
            }
        }

        Command::StatusQuery => {
            debug!("Processing status-query command");
            match coordinator.get_cache_status().await {
                CacheStatus::Ready(report) => Reply::from_status(report),
                CacheStatus::NotReady => Reply::NotReady,
            }
        }

        Command::CheckForUpdate { force } => {
            info!(force, "Processing check-for-update command");
            let installing = if force {
                coordinator.force_update_check().await
            } else {
                coordinator.check_for_update().await
            };
            let message = if installing {
                "New version installing"
            } else {
                "No new version"
            };
            Reply::Success {
                message: Some(message.to_string()),
            }
        }

        Command::ClearCache => {
            info!("Processing clear-cache command");
            match coordinator.clear_cache().await {
                Ok(cleared) => Reply::Success {
                    message: Some(format!("Cleared {} generations", cleared)),
                },
                Err(e) => Reply::Error {
                    error: format!("Clear failed: {}", e),
                },
            }
        }
    }
}
