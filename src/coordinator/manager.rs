//! Cache Coordinator - Client-side owner of registration and updates
//!
//! Registers with the agent host, mirrors its lifecycle events into a
//! registration state, throttles update probes, and exposes status, cache
//! clearing and explicit update application.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::throttle::UpdateThrottle;
use crate::agent::manifest::is_owned_by;
use crate::agent::{AgentState, ControlMessage, StatusReport};
use crate::host::{AgentHost, AgentSlot, LifecycleEvent, RegisterOptions};
use crate::store::StoreError;

/// Observed registration lifecycle
///
/// Mirrors what the host reports; the host stays authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Installing,
    /// Installed, not yet active
    Waiting,
    Activating,
    Active,
}

/// Result of a status query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheStatus {
    Ready(StatusReport),
    /// No agent controls the client, or it never replied
    NotReady,
}

type ReloadHook = Box<dyn Fn() + Send + Sync>;

/// Coordinates the agent lifecycle from the client side
pub struct CacheCoordinator {
    host: Arc<AgentHost>,
    throttle: Mutex<UpdateThrottle>,
    state: Arc<watch::Sender<RegistrationState>>,
    update_available: Arc<AtomicBool>,
    reload_hook: Mutex<Option<ReloadHook>>,
    observer: Mutex<Option<JoinHandle<()>>>,
}

impl CacheCoordinator {
    /// Create a coordinator and start observing the host
    pub fn new(host: Arc<AgentHost>, cooldown: Duration) -> Arc<Self> {
        let state = Arc::new(watch::Sender::new(RegistrationState::Unregistered));
        let update_available = Arc::new(AtomicBool::new(false));

        let observer = tokio::spawn(observe(
            Arc::clone(&host),
            host.subscribe(),
            Arc::clone(&state),
            Arc::clone(&update_available),
        ));

        Arc::new(Self {
            host,
            throttle: Mutex::new(UpdateThrottle::new(cooldown)),
            state,
            update_available,
            reload_hook: Mutex::new(None),
            observer: Mutex::new(Some(observer)),
        })
    }

    /// Install the callback that reloads the client view after an update
    pub fn set_reload_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.reload_hook) = Some(Box::new(hook));
    }

    /// Register the agent for scope `/`
    ///
    /// Idempotent. Returns false if registration failed.
    pub async fn register(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if *state == RegistrationState::Unregistered {
                *state = RegistrationState::Registering;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = ?self.state(), "Already registered");
            return true;
        }

        info!("Registering cache agent");
        match self.host.register(RegisterOptions::default()).await {
            Ok(installing) => {
                info!(installing, "Registration succeeded");
                true
            }
            Err(e) => {
                error!(error = %e, "Registration failed");
                self.state.send_replace(RegistrationState::Unregistered);
                false
            }
        }
    }

    /// Probe for a new deployment, at most once per cooldown window
    ///
    /// # Returns
    /// true if a new agent began installing
    pub async fn check_for_update(&self) -> bool {
        if self.host.registration().await.is_none() {
            debug!("Not registered, skipping update check");
            return false;
        }

        {
            let mut throttle = lock(&self.throttle);
            if !throttle.try_begin() {
                debug!(
                    remaining_secs = throttle.remaining().as_secs(),
                    "Update check too frequent, skipping"
                );
                return false;
            }
        }

        match self.host.update().await {
            Ok(installing) => {
                debug!(installing, "Update check finished");
                installing
            }
            Err(e) => {
                warn!(error = %e, "Update check failed");
                false
            }
        }
    }

    /// Check for an update regardless of the cooldown
    pub async fn force_update_check(&self) -> bool {
        lock(&self.throttle).reset();
        self.check_for_update().await
    }

    /// Activate the waiting agent, then reload the client view
    ///
    /// Returns false if no update is waiting.
    pub async fn apply_update(&self) -> bool {
        let Some(waiting) = self.host.waiting().await else {
            debug!("No update waiting");
            return false;
        };

        info!(version = %waiting.version(), "Applying update");
        if !self
            .host
            .post_message(AgentSlot::Waiting, ControlMessage::ForceActivate)
            .await
        {
            warn!(version = %waiting.version(), "Waiting agent did not accept activation");
            return false;
        }

        match lock(&self.reload_hook).as_ref() {
            Some(reload) => reload(),
            None => info!("Reload requested"),
        }
        true
    }

    /// Ask the controlling agent for its cache status
    pub async fn get_cache_status(&self) -> CacheStatus {
        let (reply, rx) = oneshot::channel();
        if !self
            .host
            .post_message(AgentSlot::Active, ControlMessage::StatusQuery { reply })
            .await
        {
            return CacheStatus::NotReady;
        }

        match rx.await {
            Ok(report) => CacheStatus::Ready(report),
            Err(_) => CacheStatus::NotReady,
        }
    }

    /// Delete every generation this subsystem owns
    ///
    /// Stores without the naming prefix are untouched. Returns how many
    /// generations were deleted.
    pub async fn clear_cache(&self) -> Result<usize, StoreError> {
        let store = self.host.store();
        let prefix = &self.host.config().prefix;

        let mut cleared = 0;
        for name in store.generation_names().await? {
            if is_owned_by(prefix, &name) && store.delete_generation(&name).await? {
                debug!(generation = %name, "Deleted generation");
                cleared += 1;
            }
        }

        info!(cleared, "Cache cleared");
        Ok(cleared)
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    /// Wait until the observed state equals `target`
    pub async fn wait_for_state(&self, target: RegistrationState) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as self
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Whether an agent controls requests
    pub async fn is_active(&self) -> bool {
        self.host.controller().await.is_some()
    }

    /// Whether a newer agent is installed and waiting
    pub fn update_available(&self) -> bool {
        self.update_available.load(Ordering::SeqCst)
    }

    /// Stop observing the host
    pub fn shutdown(&self) {
        if let Some(observer) = lock(&self.observer).take() {
            observer.abort();
        }
        debug!("Coordinator stopped");
    }
}

/// Mirror host lifecycle events into the registration state
async fn observe(
    host: Arc<AgentHost>,
    mut events: broadcast::Receiver<LifecycleEvent>,
    state: Arc<watch::Sender<RegistrationState>>,
    update_available: Arc<AtomicBool>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Lifecycle observer lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        debug!(version = %event.version, state = ?event.state, "Agent lifecycle event");

        let next = match event.state {
            AgentState::Parsed => None,
            AgentState::Installing => Some(RegistrationState::Installing),
            AgentState::Installed => {
                let controller = host.controller().await;
                if controller.is_some_and(|c| c.version() != event.version) {
                    // Not applied automatically so an active session is not disrupted
                    info!(version = %event.version, "Update available, waiting to be applied");
                    update_available.store(true, Ordering::SeqCst);
                }
                Some(RegistrationState::Waiting)
            }
            AgentState::Activating => Some(RegistrationState::Activating),
            AgentState::Activated => {
                info!(version = %event.version, "Controller changed");
                update_available.store(false, Ordering::SeqCst);
                Some(RegistrationState::Active)
            }
            AgentState::Redundant => {
                info!(version = %event.version, "Agent is redundant");
                let pending = host.agent(AgentSlot::Installing).await.is_some()
                    || host.agent(AgentSlot::Waiting).await.is_some();
                if !pending && host.controller().await.is_some() {
                    Some(RegistrationState::Active)
                } else {
                    None
                }
            }
        };

        if let Some(next) = next {
            state.send_replace(next);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
