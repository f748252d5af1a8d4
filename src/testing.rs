//! Test doubles shared by the unit tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::agent::manifest::{Deployment, ResourceManifest};
use crate::host::{DeploymentSource, SourceError, UpdateViaCache};
use crate::origin::{FetchError, Origin, OriginResponse, ResourceRequest};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Build a deployment from string slices
pub fn deployment(version: &str, statics: &[&str], audio: &[&str]) -> Deployment {
    Deployment {
        version: version.into(),
        manifest: ResourceManifest {
            static_resources: statics.iter().map(|s| s.to_string()).collect(),
            audio_resources: audio.iter().map(|s| s.to_string()).collect(),
        },
    }
}

/// Scriptable origin keyed by request path
///
/// Unknown paths answer 404. `hold` parks every fetch after it is counted
/// until `release` is called.
pub struct MockOrigin {
    responses: Mutex<HashMap<String, (u16, Bytes)>>,
    failures: Mutex<HashMap<String, FetchError>>,
    calls: Mutex<HashMap<String, usize>>,
    offline: AtomicBool,
    held: watch::Sender<bool>,
}

impl MockOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            offline: AtomicBool::new(false),
            held: watch::Sender::new(false),
        })
    }

    pub fn respond(&self, path: &str, status: u16, body: &str) {
        lock(&self.failures).remove(path);
        lock(&self.responses).insert(path.to_string(), (status, Bytes::copy_from_slice(body.as_bytes())));
    }

    /// Make a path fail with a network error
    pub fn fail(&self, path: &str) {
        let error = FetchError::Network(format!("connection refused: {}", path));
        lock(&self.failures).insert(path.to_string(), error);
    }

    /// Make a path fail after the origin was reached
    pub fn fail_request(&self, path: &str) {
        let error = FetchError::Request(format!("too many redirects: {}", path));
        lock(&self.failures).insert(path.to_string(), error);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    pub fn calls(&self, path: &str) -> usize {
        lock(&self.calls).get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }
}

#[async_trait]
impl Origin for MockOrigin {
    async fn fetch(&self, request: &ResourceRequest) -> Result<OriginResponse, FetchError> {
        let path = request.path().to_string();
        *lock(&self.calls).entry(path.clone()).or_default() += 1;

        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        if self.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Network(format!("connection refused: {}", path)));
        }
        if let Some(error) = lock(&self.failures).get(&path).cloned() {
            return Err(error);
        }

        let scripted = lock(&self.responses).get(&path).cloned();
        let (status, body) = scripted.unwrap_or((404, Bytes::from_static(b"Not Found")));
        Ok(OriginResponse {
            status,
            content_type: Some("application/octet-stream".to_string()),
            body,
        })
    }
}

/// Deployment source returning whatever was last published
pub struct StaticDeploymentSource {
    current: Mutex<Option<Deployment>>,
    probes: AtomicUsize,
    failing: AtomicBool,
    last_mode: Mutex<Option<UpdateViaCache>>,
}

impl StaticDeploymentSource {
    pub fn new(deployment: Deployment) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new(Some(deployment)),
            probes: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            last_mode: Mutex::new(None),
        })
    }

    pub fn publish(&self, deployment: Deployment) {
        *lock(&self.current) = Some(deployment);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn last_mode(&self) -> Option<UpdateViaCache> {
        *lock(&self.last_mode)
    }
}

#[async_trait]
impl DeploymentSource for StaticDeploymentSource {
    async fn fetch_deployment(&self, mode: UpdateViaCache) -> Result<Deployment, SourceError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_mode) = Some(mode);

        if self.failing.load(Ordering::SeqCst) {
            return Err(SourceError::Fetch("deployment source offline".to_string()));
        }

        lock(&self.current)
            .clone()
            .ok_or_else(|| SourceError::Invalid("nothing published".to_string()))
    }
}
