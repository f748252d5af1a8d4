//! Agent host
//!
//! Stands in for the execution environment that runs cache agents: owns
//! the registration, drives agents from install to activation and routes
//! intercepted requests to the controller.

pub mod registry;
pub mod source;

pub use registry::{AgentHost, AgentSlot, LifecycleEvent, RegisterOptions};
pub use source::{
    DeploymentSource, FileDeploymentSource, HttpDeploymentSource, SourceError, UpdateViaCache,
};
