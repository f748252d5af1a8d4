//! Offline Cache Daemon - request interception with versioned resource generations
//!
//! Runs the cache agent host and coordinator, and exposes them to local
//! clients over a Unix socket.

mod agent;
mod config;
mod coordinator;
mod host;
mod ipc;
mod origin;
mod store;
#[cfg(test)]
mod testing;

use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::{Config, DeploymentLocation, StoreBackend};
use coordinator::{CacheCoordinator, RegistrationState};
use host::{AgentHost, DeploymentSource, FileDeploymentSource, HttpDeploymentSource};
use ipc::{send_command, IpcServer, Reply};
use origin::HttpOrigin;
use store::{DiskStore, MemoryStore, ResourceStore};

/// CLI command
#[derive(Debug)]
enum Command {
    /// Run the daemon (default)
    Serve,
    /// Show generations and manifest sizes
    Status,
    /// Activate a waiting update
    Activate,
    /// Probe for a new deployment
    CheckUpdate { force: bool },
    /// Delete owned generations
    Clear,
    /// Fetch a URL through the agent
    Fetch { url: String },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"Offline Cache Daemon - serve resources from versioned local generations

USAGE:
    offline-cache [--config <path>] [COMMAND]

COMMANDS:
    serve          Run the daemon (default)
    status         Show active generations and manifest sizes
    activate       Activate a waiting update
    check-update   Probe for a new deployment (throttled; --force skips the cooldown)
    clear          Delete every generation owned by this daemon
    fetch <url>    Fetch a URL through the controlling agent
    help           Show this help message

ENVIRONMENT:
    OFFLINE_CACHE_CONFIG          Config file (JSON)
    OFFLINE_CACHE_ORIGIN          Hosting origin URL
    OFFLINE_CACHE_PREFIX          Generation name prefix
    OFFLINE_CACHE_SOCKET          Control socket path
    OFFLINE_CACHE_STORE_DIR       Store directory, or "memory"
    OFFLINE_CACHE_DEPLOYMENT_URL  Deployment descriptor URL
    OFFLINE_CACHE_MANIFEST        Local deployment descriptor file
    RUST_LOG                      Log level (trace, debug, info, warn, error)
"#
    );
}

fn parse_args() -> Result<(Option<PathBuf>, Command)> {
    let mut args: Vec<String> = env::args().skip(1).collect();

    let mut config_path = None;
    if let Some(pos) = args.iter().position(|a| a == "--config") {
        if pos + 1 >= args.len() {
            return Err(anyhow!("--config requires a path"));
        }
        config_path = Some(PathBuf::from(args.remove(pos + 1)));
        args.remove(pos);
    }

    let command = match args.first().map(String::as_str) {
        None | Some("serve") => Command::Serve,
        Some("status") => Command::Status,
        Some("activate") => Command::Activate,
        Some("check-update") => Command::CheckUpdate {
            force: args.get(1).is_some_and(|a| a == "--force"),
        },
        Some("clear") => Command::Clear,
        Some("fetch") => match args.get(1) {
            Some(url) => Command::Fetch { url: url.clone() },
            None => return Err(anyhow!("Usage: offline-cache fetch <url>")),
        },
        Some("help" | "--help" | "-h") => Command::Help,
        Some(other) => {
            eprintln!("Unknown command: {}", other);
            Command::Help
        }
    };

    Ok((config_path, command))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let log_level = env::var("RUST_LOG")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Level::INFO);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (config_path, command) = match parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    if let Command::Help = command {
        print_help();
        return Ok(());
    }

    let config_path = config_path.or_else(|| env::var(config::ENV_CONFIG).ok().map(PathBuf::from));
    let config = Config::load(config_path.as_deref())?;

    let ipc_command = match command {
        Command::Serve => return serve(config).await,
        Command::Help => return Ok(()),
        Command::Status => ipc::Command::StatusQuery,
        Command::Activate => ipc::Command::ForceActivate,
        Command::CheckUpdate { force } => ipc::Command::CheckForUpdate { force },
        Command::Clear => ipc::Command::ClearCache,
        Command::Fetch { url } => ipc::Command::Fetch {
            method: "GET".to_string(),
            url,
        },
    };

    let reply = send_command(&config.socket_path, &ipc_command).await?;
    print_reply(&reply)
}

/// Run the daemon until Ctrl+C
async fn serve(config: Config) -> Result<()> {
    info!(origin = %config.origin, prefix = %config.prefix, "Starting offline cache daemon");

    let mut disk_store = None;
    let store: Arc<dyn ResourceStore> = match config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Disk => {
            let disk = match &config.store_dir {
                Some(dir) => DiskStore::with_dir(dir.clone())?,
                None => DiskStore::new()?,
            };
            info!(root = %disk.root().display(), "Disk store opened");
            let disk = Arc::new(disk);
            disk_store = Some(Arc::clone(&disk));
            disk
        }
    };

    let origin = Arc::new(HttpOrigin::new(config.request_timeout())?);
    let source: Arc<dyn DeploymentSource> = match config.deployment_location()? {
        DeploymentLocation::Url(url) => {
            info!(url = %url, "Deployment descriptor from origin");
            Arc::new(HttpDeploymentSource::new(url, config.request_timeout())?)
        }
        DeploymentLocation::File(path) => {
            info!(path = %path.display(), "Deployment descriptor from file");
            Arc::new(FileDeploymentSource::new(path))
        }
    };

    let host = AgentHost::new(config.agent_config()?, store, origin, source);
    let coordinator = CacheCoordinator::new(Arc::clone(&host), config.update_cooldown());
    coordinator.set_reload_hook(|| info!("Update applied, clients should reload"));

    if !coordinator.register().await {
        error!("Initial registration failed, retrying on the next update check");
    } else if tokio::time::timeout(
        config.request_timeout(),
        coordinator.wait_for_state(RegistrationState::Active),
    )
    .await
    .is_err()
    {
        warn!(state = ?coordinator.state(), "Agent not active yet, serving passthrough");
    }

    let mut ipc_server = IpcServer::new(
        Arc::clone(&host),
        Arc::clone(&coordinator),
        config.socket_path.clone(),
    );
    if let Err(e) = ipc_server.start().await {
        error!(error = %e, "Failed to start IPC server");
        return Err(e);
    }
    let ipc_server = Arc::new(ipc_server);

    let running = Arc::clone(&ipc_server);
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = running.run().await {
            error!(error = %e, "IPC server error");
        }
    });

    // Periodic update checks; the coordinator throttles them
    let checker = Arc::clone(&coordinator);
    let period = config.update_interval();
    let update_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            if !checker.is_active().await && !checker.register().await {
                continue;
            }
            checker.check_for_update().await;
        }
    });

    info!(
        socket = %ipc_server.socket_path().display(),
        "Daemon ready. Press Ctrl+C to stop."
    );

    tokio::signal::ctrl_c().await?;

    info!(
        connections = ipc_server.connection_count().await,
        "Received shutdown signal, draining background work..."
    );
    update_handle.abort();
    ipc_handle.abort();
    coordinator.shutdown();
    host.shutdown().await;
    ipc_server.stop().await?;

    if let Some(disk) = disk_store {
        disk.log_metrics();
    }

    info!("Shutdown complete.");
    Ok(())
}

fn print_reply(reply: &Reply) -> Result<()> {
    match reply {
        Reply::Response {
            status,
            content_type,
            source,
            ..
        } => {
            let body = reply.decoded_body().transpose()?.unwrap_or_default();
            println!(
                "{} from {:?} ({}, {} bytes)",
                status,
                source,
                content_type.as_deref().unwrap_or("no content type"),
                body.len()
            );
        }
        Reply::Passthrough => println!("Not handled by the agent; fetch from the network."),
        Reply::Unavailable { reason } => println!("Unavailable: {}", reason),
        Reply::Status {
            generations,
            static_count,
            audio_count,
        } => {
            println!("Generations:");
            for name in generations {
                println!("  {}", name);
            }
            println!("Static resources: {}", static_count);
            println!("Audio resources:  {}", audio_count);
        }
        Reply::NotReady => println!("No agent controls requests yet."),
        Reply::Success { message } => println!("{}", message.as_deref().unwrap_or("OK")),
        Reply::Error { error } => return Err(anyhow!("{}", error)),
    }
    Ok(())
}
