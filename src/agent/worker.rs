//! Cache Agent
//!
//! Owns one deployment's generations. Installs them from the manifest,
//! purges superseded generations on activation, answers intercepted
//! requests with the strategy the router picks, and handles control
//! messages. Store failures degrade to cache misses and origin failures to
//! an `Unavailable` outcome; neither ever escapes as an error.

use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

use super::manifest::{Deployment, GenerationKind, GenerationNames};
use super::messages::{ControlMessage, StatusReport};
use super::router::{Route, Strategy, StrategyRouter};
use super::AgentState;
use crate::origin::{FetchError, Origin, OriginResponse, ResourceRequest};
use crate::store::{CachedEntry, GenerationHandle, RequestKey, ResourceStore, StoreError};

/// Settings shared by every agent a host creates
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hosting origin; only requests to it are intercepted
    pub origin: Url,
    /// Prefix of every generation name this subsystem owns
    pub prefix: String,
    /// Request activation as soon as install finishes
    pub skip_waiting_on_install: bool,
}

/// Outcome of installing one manifest group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupReport {
    pub succeeded: usize,
    pub failed: usize,
}

/// Outcome of a full install
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub static_group: GroupReport,
    pub audio_group: GroupReport,
}

/// Why a single manifest resource could not be cached
#[derive(Debug, thiserror::Error)]
enum ResourceFailure {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Store,
    Origin,
}

/// Response produced by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub source: ResponseSource,
}

impl AgentResponse {
    fn from_entry(entry: CachedEntry) -> Self {
        Self {
            status: entry.status,
            content_type: entry.content_type,
            body: entry.body,
            source: ResponseSource::Store,
        }
    }

    fn from_origin(response: OriginResponse) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type,
            body: response.body,
            source: ResponseSource::Origin,
        }
    }
}

/// Result of intercepting a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The agent does not handle this request; the caller goes to the network
    Passthrough,
    /// Answered from the store or the origin (origin error statuses included)
    Response(AgentResponse),
    /// Origin unreachable and nothing stored
    Unavailable(String),
}

/// A cache agent bound to one deployment version
pub struct CacheAgent {
    deployment: Deployment,
    names: GenerationNames,
    router: StrategyRouter,
    skip_waiting_on_install: bool,
    store: Arc<dyn ResourceStore>,
    origin: Arc<dyn Origin>,
    /// Lifecycle state, driven by the host
    state: watch::Sender<AgentState>,
    /// Set once the agent asks to skip the waiting period
    skip_waiting: watch::Sender<bool>,
    /// Keys with a background revalidation in flight
    revalidating: Arc<Mutex<HashSet<RequestKey>>>,
    /// Background revalidation tasks
    background: Mutex<JoinSet<()>>,
}

impl CacheAgent {
    pub fn new(
        deployment: Deployment,
        config: &AgentConfig,
        store: Arc<dyn ResourceStore>,
        origin: Arc<dyn Origin>,
    ) -> Self {
        let names = GenerationNames::new(&config.prefix, &deployment.version);
        let router = StrategyRouter::new(config.origin.clone(), &deployment.manifest);

        Self {
            deployment,
            names,
            router,
            skip_waiting_on_install: config.skip_waiting_on_install,
            store,
            origin,
            state: watch::Sender::new(AgentState::Parsed),
            skip_waiting: watch::Sender::new(false),
            revalidating: Arc::new(Mutex::new(HashSet::new())),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn version(&self) -> &str {
        &self.deployment.version
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: AgentState) {
        self.state.send_replace(state);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Ask the host to activate this agent without waiting
    pub fn skip_waiting(&self) {
        self.skip_waiting.send_replace(true);
    }

    pub fn subscribe_skip_waiting(&self) -> watch::Receiver<bool> {
        self.skip_waiting.subscribe()
    }

    /// Populate both generations from the manifest
    ///
    /// Every resource is attempted; failures are counted, never fatal.
    pub async fn install(&self) -> InstallReport {
        info!(version = %self.version(), "Installing agent");

        let (static_group, audio_group) = tokio::join!(
            self.install_group(GenerationKind::Static),
            self.install_group(GenerationKind::Audio),
        );
        let report = InstallReport {
            static_group,
            audio_group,
        };

        info!(
            version = %self.version(),
            static_ok = report.static_group.succeeded,
            static_failed = report.static_group.failed,
            audio_ok = report.audio_group.succeeded,
            audio_failed = report.audio_group.failed,
            "Install complete"
        );

        if self.skip_waiting_on_install {
            self.skip_waiting();
        }

        report
    }

    async fn install_group(&self, kind: GenerationKind) -> GroupReport {
        let resources = self.deployment.manifest.resources(kind);
        let name = self.names.name(kind);
        let mut report = GroupReport::default();

        let handle = match self.store.open(name).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(generation = name, error = %e, "Cannot open generation, counting group as failed");
                report.failed = resources.len();
                return report;
            }
        };

        let mut tasks = JoinSet::new();
        for resource in resources {
            let Some(url) = self.router.resolve(resource) else {
                warn!(generation = name, resource = %resource, "Invalid manifest entry");
                report.failed += 1;
                continue;
            };

            let store = Arc::clone(&self.store);
            let origin = Arc::clone(&self.origin);
            let handle = handle.clone();
            tasks.spawn(async move {
                let request = ResourceRequest::get(url);
                let result = cache_resource(store.as_ref(), origin.as_ref(), &handle, &request).await;
                (request.url, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((url, Ok(()))) => {
                    trace!(generation = name, url = %url, "Cached resource");
                    report.succeeded += 1;
                }
                Ok((url, Err(e))) => {
                    warn!(generation = name, url = %url, error = %e, "Failed to cache resource");
                    report.failed += 1;
                }
                Err(e) => {
                    error!(generation = name, error = %e, "Resource task aborted");
                    report.failed += 1;
                }
            }
        }

        debug!(
            generation = name,
            succeeded = report.succeeded,
            failed = report.failed,
            "Generation populated"
        );
        report
    }

    /// Delete every owned generation that is not current
    ///
    /// Must complete before the host lets this agent control requests.
    /// Returns the purged names.
    pub async fn activate(&self) -> Result<Vec<String>, StoreError> {
        info!(version = %self.version(), "Activating agent");

        let names = self.store.generation_names().await?;
        let mut purged = Vec::new();

        for name in names.into_iter().filter(|n| self.names.is_stale(n)) {
            match self.store.delete_generation(&name).await {
                Ok(_) => {
                    info!(generation = %name, "Deleted stale generation");
                    purged.push(name);
                }
                Err(e) => {
                    warn!(generation = %name, error = %e, "Failed to delete stale generation");
                }
            }
        }

        Ok(purged)
    }

    /// Answer an intercepted request
    pub async fn intercept(&self, request: ResourceRequest) -> FetchOutcome {
        match self.router.route(&request) {
            Route::Passthrough => {
                trace!(method = %request.method, url = %request.url, "Passing request through");
                FetchOutcome::Passthrough
            }
            Route::Strategy(Strategy::RefreshOnHit) => self.refresh_on_hit(request).await,
            Route::Strategy(Strategy::CacheFirst) => self.cache_first(request).await,
            Route::Strategy(Strategy::NetworkFirst) => self.network_first(request).await,
        }
    }

    async fn refresh_on_hit(&self, request: ResourceRequest) -> FetchOutcome {
        let handle = self.open_generation(GenerationKind::Audio).await;
        let key = RequestKey::from_request(&request);

        if let Some(entry) = self.lookup(&handle, &key).await {
            trace!(key = %key, "Audio cache HIT");
            self.spawn_revalidation(handle, key, request);
            return FetchOutcome::Response(AgentResponse::from_entry(entry));
        }

        trace!(key = %key, "Audio cache MISS");
        self.fetch_and_store(&handle, key, &request).await
    }

    async fn cache_first(&self, request: ResourceRequest) -> FetchOutcome {
        let handle = self.open_generation(GenerationKind::Static).await;
        let key = RequestKey::from_request(&request);

        if let Some(entry) = self.lookup(&handle, &key).await {
            trace!(key = %key, "Static cache HIT");
            return FetchOutcome::Response(AgentResponse::from_entry(entry));
        }

        trace!(key = %key, "Static cache MISS");
        self.fetch_and_store(&handle, key, &request).await
    }

    async fn network_first(&self, request: ResourceRequest) -> FetchOutcome {
        let error = match self.origin.fetch(&request).await {
            Ok(response) => return FetchOutcome::Response(AgentResponse::from_origin(response)),
            Err(e) => e,
        };

        let key = RequestKey::from_request(&request);
        let unreachable = error.is_network();
        match self.match_any(&key).await {
            Some(entry) => {
                debug!(key = %key, unreachable, error = %error, "Origin fetch failed, served from store");
                FetchOutcome::Response(AgentResponse::from_entry(entry))
            }
            None => {
                debug!(key = %key, unreachable, error = %error, "Origin fetch failed and nothing stored");
                FetchOutcome::Unavailable(error.to_string())
            }
        }
    }

    /// Fetch from origin, storing a successful response
    async fn fetch_and_store(
        &self,
        handle: &GenerationHandle,
        key: RequestKey,
        request: &ResourceRequest,
    ) -> FetchOutcome {
        match self.origin.fetch(request).await {
            Ok(response) => {
                if let Some(entry) = CachedEntry::from_response(key, &response) {
                    if let Err(e) = self.store.put(handle, entry).await {
                        warn!(generation = handle.name(), url = %request.url, error = %e, "Failed to store response");
                    }
                }
                FetchOutcome::Response(AgentResponse::from_origin(response))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Origin fetch failed");
                FetchOutcome::Unavailable(e.to_string())
            }
        }
    }

    /// Look a key up in one generation; store errors count as a miss
    async fn lookup(&self, handle: &GenerationHandle, key: &RequestKey) -> Option<CachedEntry> {
        match self.store.get(handle, key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(generation = handle.name(), key = %key, error = %e, "Store lookup failed, treating as miss");
                None
            }
        }
    }

    /// Look a key up across every generation, current ones first
    async fn match_any(&self, key: &RequestKey) -> Option<CachedEntry> {
        let present = match self.store.generation_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(key = %key, error = %e, "Cannot list generations, treating as miss");
                return None;
            }
        };

        let current = self.names.current();
        let ordered = current
            .iter()
            .filter(|name| present.contains(**name))
            .map(|name| name.to_string())
            .chain(present.iter().filter(|name| !current.contains(&name.as_str())).cloned());

        for name in ordered {
            if let Some(entry) = self.lookup(&GenerationHandle::new(name), key).await {
                return Some(entry);
            }
        }
        None
    }

    /// Refresh a stored entry without blocking the caller
    fn spawn_revalidation(&self, handle: GenerationHandle, key: RequestKey, request: ResourceRequest) {
        if !lock(&self.revalidating).insert(key.clone()) {
            trace!(key = %key, "Revalidation already in flight");
            return;
        }

        let store = Arc::clone(&self.store);
        let origin = Arc::clone(&self.origin);
        let revalidating = Arc::clone(&self.revalidating);

        let task = async move {
            match origin.fetch(&request).await {
                Ok(response) => match CachedEntry::from_response(key.clone(), &response) {
                    Some(entry) => match store.put(&handle, entry).await {
                        Ok(()) => debug!(key = %key, "Refreshed stored entry"),
                        Err(e) => debug!(key = %key, error = %e, "Failed to store refreshed entry"),
                    },
                    None => {
                        debug!(key = %key, status = response.status, "Revalidation not successful, keeping stored entry");
                    }
                },
                Err(e) => debug!(key = %key, error = %e, "Revalidation failed, keeping stored entry"),
            }
            lock(&revalidating).remove(&key);
        };

        let mut background = lock(&self.background);
        while background.try_join_next().is_some() {}
        background.spawn(task);
    }

    /// Wait for every background revalidation started so far
    pub async fn wait_for_background(&self) {
        let mut tasks = std::mem::take(&mut *lock(&self.background));
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Background revalidation task failed");
            }
        }
    }

    /// Handle a control message
    pub async fn handle_message(&self, message: ControlMessage) {
        match message {
            ControlMessage::ForceActivate => {
                info!(version = %self.version(), "Forced activation requested");
                self.skip_waiting();
            }
            ControlMessage::StatusQuery { reply } => {
                let report = self.status().await;
                if reply.send(report).is_err() {
                    debug!("Status requester went away before the reply");
                }
            }
        }
    }

    /// Current generations present in the store plus manifest group sizes
    pub async fn status(&self) -> StatusReport {
        let present = match self.store.generation_names().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Cannot list generations for status");
                BTreeSet::new()
            }
        };

        StatusReport {
            generations: self
                .names
                .current()
                .iter()
                .filter(|name| present.contains(**name))
                .map(|name| name.to_string())
                .collect(),
            static_count: self.deployment.manifest.static_resources.len(),
            audio_count: self.deployment.manifest.audio_resources.len(),
        }
    }

    /// Open (or recreate) a current generation for a strategy
    ///
    /// An unavailable store yields a bare handle; lookups through it miss and
    /// writes fail, so the request still reaches the origin.
    async fn open_generation(&self, kind: GenerationKind) -> GenerationHandle {
        let name = self.names.name(kind);
        match self.store.open(name).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(generation = name, error = %e, "Failed to open generation");
                GenerationHandle::new(name)
            }
        }
    }
}

/// Fetch one manifest resource and store it
async fn cache_resource(
    store: &dyn ResourceStore,
    origin: &dyn Origin,
    handle: &GenerationHandle,
    request: &ResourceRequest,
) -> Result<(), ResourceFailure> {
    let key = RequestKey::from_request(request);
    let response = origin.fetch(request).await?.error_for_status()?;

    if let Some(entry) = CachedEntry::from_response(key, &response) {
        store.put(handle, entry).await?;
    }
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
