//! Origin server client

pub mod client;
pub mod errors;
pub mod types;

pub use client::{HttpOrigin, Origin, REQUEST_TIMEOUT};
pub use errors::FetchError;
pub use types::{OriginResponse, ResourceRequest};
