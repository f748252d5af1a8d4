//! Strategy Router
//!
//! Pure classification of an intercepted request into the caching strategy
//! that answers it. Cross-origin and non-GET requests are never classified.

use std::collections::HashSet;

use reqwest::{Method, Url};
use tracing::warn;

use super::manifest::ResourceManifest;
use crate::origin::ResourceRequest;

/// Path prefix served by the refresh-on-hit strategy
pub const AUDIO_PREFIX: &str = "/audio/";

/// Response-construction policy for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Serve from the audio generation, refresh it in the background
    RefreshOnHit,
    /// Serve from the static generation, fetch and store on miss
    CacheFirst,
    /// Fetch from origin, fall back to any generation when unreachable
    NetworkFirst,
}

/// Outcome of classifying a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not handled by the agent at all
    Passthrough,
    Strategy(Strategy),
}

/// Maps requests to strategies for one deployment
#[derive(Debug, Clone)]
pub struct StrategyRouter {
    /// Hosting origin; other origins pass through
    origin: Url,
    /// Paths of the static manifest group
    static_paths: HashSet<String>,
}

impl StrategyRouter {
    pub fn new(origin: Url, manifest: &ResourceManifest) -> Self {
        let mut static_paths = HashSet::new();
        for resource in &manifest.static_resources {
            match origin.join(resource) {
                Ok(url) if url.origin() == origin.origin() => {
                    static_paths.insert(url.path().to_string());
                }
                Ok(url) => {
                    warn!(resource = %url, "Ignoring cross-origin static resource");
                }
                Err(e) => {
                    warn!(resource = %resource, error = %e, "Ignoring invalid static resource");
                }
            }
        }

        Self {
            origin,
            static_paths,
        }
    }

    /// Resolve a manifest entry against the hosting origin
    pub fn resolve(&self, resource: &str) -> Option<Url> {
        self.origin.join(resource).ok()
    }

    /// Classify a request
    pub fn route(&self, request: &ResourceRequest) -> Route {
        if !request.is_same_origin(&self.origin) || request.method != Method::GET {
            return Route::Passthrough;
        }

        let path = request.path();
        if path.starts_with(AUDIO_PREFIX) {
            Route::Strategy(Strategy::RefreshOnHit)
        } else if path == "/" || self.static_paths.contains(path) {
            Route::Strategy(Strategy::CacheFirst)
        } else {
            Route::Strategy(Strategy::NetworkFirst)
        }
    }
}
