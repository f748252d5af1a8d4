//! Control socket for local clients

pub mod client;
pub mod protocol;
pub mod server;

pub use client::send_command;
pub use protocol::{Command, Reply, SOCKET_PATH};
pub use server::IpcServer;
