//! Agent Host - Runs cache agents through their lifecycle
//!
//! Holds the registration, the installing/waiting/active agent slots and
//! the lifecycle event stream. Every agent state change is made here and
//! broadcast to observers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::source::{DeploymentSource, SourceError, UpdateViaCache};
use crate::agent::{
    AgentConfig, AgentEvent, AgentState, CacheAgent, ControlMessage, EventDispatcher,
    EventOutcome, FetchOutcome,
};
use crate::origin::{Origin, ResourceRequest};
use crate::store::ResourceStore;

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 64;

/// Registration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOptions {
    /// Path scope the registration controls
    pub scope: String,
    pub update_via_cache: UpdateViaCache,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            scope: "/".to_string(),
            update_via_cache: UpdateViaCache::None,
        }
    }
}

/// An agent changed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub version: String,
    pub state: AgentState,
}

/// Which agent a message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSlot {
    Installing,
    Waiting,
    Active,
}

/// Update error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpdateError {
    #[error("No registration exists")]
    NotRegistered,

    #[error(transparent)]
    Source(#[from] SourceError),
}

#[derive(Default)]
struct Slots {
    installing: Option<EventDispatcher>,
    waiting: Option<EventDispatcher>,
    /// The controller
    active: Option<EventDispatcher>,
}

impl Slots {
    fn get(&self, slot: AgentSlot) -> Option<&EventDispatcher> {
        match slot {
            AgentSlot::Installing => self.installing.as_ref(),
            AgentSlot::Waiting => self.waiting.as_ref(),
            AgentSlot::Active => self.active.as_ref(),
        }
    }

    /// Version of the most recently created agent
    fn newest_version(&self) -> Option<&str> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
            .map(|d| d.agent().version())
    }

    fn holds(slot: &Option<EventDispatcher>, agent: &Arc<CacheAgent>) -> bool {
        slot.as_ref().is_some_and(|d| Arc::ptr_eq(d.agent(), agent))
    }
}

/// Execution environment for cache agents
pub struct AgentHost {
    config: AgentConfig,
    store: Arc<dyn ResourceStore>,
    origin: Arc<dyn Origin>,
    source: Arc<dyn DeploymentSource>,
    registration: RwLock<Option<RegisterOptions>>,
    slots: RwLock<Slots>,
    /// Serializes update probes
    update_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<LifecycleEvent>,
    lifecycles: Mutex<JoinSet<()>>,
}

impl AgentHost {
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn ResourceStore>,
        origin: Arc<dyn Origin>,
        source: Arc<dyn DeploymentSource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            config,
            store,
            origin,
            source,
            registration: RwLock::new(None),
            slots: RwLock::new(Slots::default()),
            update_lock: tokio::sync::Mutex::new(()),
            events,
            lifecycles: Mutex::new(JoinSet::new()),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub async fn registration(&self) -> Option<RegisterOptions> {
        self.registration.read().await.clone()
    }

    /// Register and probe for the first deployment
    ///
    /// # Returns
    /// Ok(true) if an agent began installing, Ok(false) if already
    /// registered or the deployment is unchanged. A failed first probe
    /// leaves the host unregistered.
    pub async fn register(self: &Arc<Self>, options: RegisterOptions) -> Result<bool, UpdateError> {
        {
            let mut registration = self.registration.write().await;
            if let Some(existing) = registration.as_ref() {
                debug!(scope = %existing.scope, "Already registered");
                return Ok(false);
            }
            info!(scope = %options.scope, update_via_cache = ?options.update_via_cache, "Registering");
            *registration = Some(options);
        }

        let result = self.update().await;
        if result.is_err() {
            // A registration whose first probe failed never existed
            *self.registration.write().await = None;
        }
        result
    }

    /// Probe the deployment source and install a new agent if the version changed
    pub async fn update(self: &Arc<Self>) -> Result<bool, UpdateError> {
        let _guard = self.update_lock.lock().await;

        let mode = match self.registration.read().await.as_ref() {
            Some(options) => options.update_via_cache,
            None => return Err(UpdateError::NotRegistered),
        };

        let deployment = self.source.fetch_deployment(mode).await?;

        if self.slots.read().await.newest_version() == Some(deployment.version.as_str()) {
            debug!(version = %deployment.version, "Deployment unchanged");
            return Ok(false);
        }

        info!(version = %deployment.version, "New deployment found");

        let agent = Arc::new(CacheAgent::new(
            deployment,
            &self.config,
            Arc::clone(&self.store),
            Arc::clone(&self.origin),
        ));
        let dispatcher = EventDispatcher::new(Arc::clone(&agent));

        let superseded = self.slots.write().await.installing.replace(dispatcher.clone());
        if let Some(previous) = superseded {
            self.transition(previous.agent(), AgentState::Redundant);
        }
        self.transition(&agent, AgentState::Installing);

        let host = Arc::clone(self);
        let mut lifecycles = lock(&self.lifecycles);
        while lifecycles.try_join_next().is_some() {}
        lifecycles.spawn(async move { host.run_lifecycle(dispatcher).await });

        Ok(true)
    }

    /// Install, wait, activate, claim
    async fn run_lifecycle(self: Arc<Self>, dispatcher: EventDispatcher) {
        let agent = Arc::clone(dispatcher.agent());

        match dispatcher.dispatch(AgentEvent::Install).wait().await {
            Ok(EventOutcome::Installed(report)) => {
                debug!(
                    version = %agent.version(),
                    failed = report.static_group.failed + report.audio_group.failed,
                    "Install finished"
                );
            }
            Ok(other) => debug!(outcome = ?other, "Unexpected install outcome"),
            Err(e) => {
                warn!(version = %agent.version(), error = %e, "Install failed, discarding agent");
                let mut slots = self.slots.write().await;
                if Slots::holds(&slots.installing, &agent) {
                    slots.installing = None;
                }
                drop(slots);
                self.transition(&agent, AgentState::Redundant);
                return;
            }
        }

        // installing -> waiting
        let has_controller = {
            let mut slots = self.slots.write().await;
            if !Slots::holds(&slots.installing, &agent) {
                debug!(version = %agent.version(), "Agent superseded during install");
                return;
            }
            slots.installing = None;
            if let Some(previous) = slots.waiting.replace(dispatcher.clone()) {
                self.transition(previous.agent(), AgentState::Redundant);
            }
            slots.active.is_some()
        };
        self.transition(&agent, AgentState::Installed);

        if has_controller {
            let mut skip = agent.subscribe_skip_waiting();
            let mut state = agent.subscribe_state();
            tokio::select! {
                _ = skip.wait_for(|skip| *skip) => {}
                _ = state.wait_for(|state| state.is_terminal()) => {
                    debug!(version = %agent.version(), "Waiting agent superseded");
                    return;
                }
            }
        }

        // waiting -> activating
        {
            let mut slots = self.slots.write().await;
            if !Slots::holds(&slots.waiting, &agent) {
                return;
            }
            slots.waiting = None;
        }
        self.transition(&agent, AgentState::Activating);

        // Cleanup must finish before the agent claims control
        match dispatcher.dispatch(AgentEvent::Activate).wait().await {
            Ok(EventOutcome::Activated { purged }) => {
                info!(version = %agent.version(), purged = purged.len(), "Activation cleanup finished");
            }
            Ok(other) => debug!(outcome = ?other, "Unexpected activate outcome"),
            Err(e) => warn!(version = %agent.version(), error = %e, "Activation cleanup failed"),
        }

        let previous = self.slots.write().await.active.replace(dispatcher);
        self.transition(&agent, AgentState::Activated);
        info!(version = %agent.version(), "Agent controls requests");

        if let Some(previous) = previous {
            info!(version = %previous.agent().version(), "Previous agent is redundant");
            self.transition(previous.agent(), AgentState::Redundant);
        }
    }

    fn transition(&self, agent: &CacheAgent, state: AgentState) {
        agent.set_state(state);
        // No receivers is fine
        let _ = self.events.send(LifecycleEvent {
            version: agent.version().to_string(),
            state,
        });
    }

    /// Route a request to the controlling agent
    ///
    /// Without a controller, or when the handler fails, the request goes
    /// straight to the network.
    pub async fn handle_fetch(&self, request: ResourceRequest) -> FetchOutcome {
        let Some(controller) = self.slots.read().await.active.clone() else {
            return FetchOutcome::Passthrough;
        };

        match controller.dispatch(AgentEvent::Fetch(request)).wait().await {
            Ok(EventOutcome::Fetched(outcome)) => outcome,
            Ok(_) | Err(_) => FetchOutcome::Passthrough,
        }
    }

    /// Deliver a control message to the agent in a slot
    ///
    /// Returns false if the slot is empty or the handler failed. A dropped
    /// message drops its reply channel with it.
    pub async fn post_message(&self, slot: AgentSlot, message: ControlMessage) -> bool {
        let Some(target) = self.slots.read().await.get(slot).cloned() else {
            debug!(kind = message.kind(), ?slot, "No agent to receive message");
            return false;
        };

        target.dispatch(AgentEvent::Message(message)).wait().await.is_ok()
    }

    pub async fn agent(&self, slot: AgentSlot) -> Option<Arc<CacheAgent>> {
        self.slots.read().await.get(slot).map(|d| Arc::clone(d.agent()))
    }

    pub async fn controller(&self) -> Option<Arc<CacheAgent>> {
        self.agent(AgentSlot::Active).await
    }

    pub async fn waiting(&self) -> Option<Arc<CacheAgent>> {
        self.agent(AgentSlot::Waiting).await
    }

    /// Stop lifecycle tasks and drain background revalidations
    pub async fn shutdown(&self) {
        let mut lifecycles = std::mem::take(&mut *lock(&self.lifecycles));
        lifecycles.abort_all();
        while lifecycles.join_next().await.is_some() {}

        let agents: Vec<Arc<CacheAgent>> = {
            let slots = self.slots.read().await;
            [&slots.installing, &slots.waiting, &slots.active]
                .into_iter()
                .flatten()
                .map(|d| Arc::clone(d.agent()))
                .collect()
        };
        for agent in agents {
            agent.wait_for_background().await;
        }

        info!("Agent host stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
