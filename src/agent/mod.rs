//! Cache agent
//!
//! The per-deployment worker that pre-caches resources, purges superseded
//! generations and answers intercepted requests.

pub mod dispatch;
pub mod manifest;
pub mod messages;
pub mod router;
pub mod worker;

pub use dispatch::{AgentEvent, EventDispatcher, EventOutcome};
pub use manifest::Deployment;
pub use messages::{ControlMessage, StatusReport};
pub use worker::{AgentConfig, AgentResponse, CacheAgent, FetchOutcome, ResponseSource};

use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    /// Created, install not started
    Parsed,
    Installing,
    /// Installed and waiting to take over
    Installed,
    Activating,
    /// Controls requests
    Activated,
    /// Superseded or failed; never used again
    Redundant,
}

impl AgentState {
    /// Whether the agent is in a state it can never leave
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Redundant)
    }
}
