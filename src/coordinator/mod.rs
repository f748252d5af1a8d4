//! Cache coordinator
//!
//! Client-side view of the agent lifecycle: registration, throttled update
//! checks, status queries, cache clearing and update application.

pub mod manager;
pub mod throttle;

pub use manager::{CacheCoordinator, CacheStatus, RegistrationState};
pub use throttle::DEFAULT_COOLDOWN;
