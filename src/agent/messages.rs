//! Control messages accepted by a running agent

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Inbound control message
#[derive(Debug)]
pub enum ControlMessage {
    /// Skip the waiting period and activate as soon as possible
    ForceActivate,
    /// Report cache status over the provided one-shot channel
    StatusQuery {
        reply: oneshot::Sender<StatusReport>,
    },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::ForceActivate => "force-activate",
            ControlMessage::StatusQuery { .. } => "status-query",
        }
    }
}

/// Reply to a status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Active generation names present in the store
    pub generations: Vec<String>,
    /// Size of the static manifest group
    pub static_count: usize,
    /// Size of the audio manifest group
    pub audio_count: usize,
}
