//! Event dispatcher
//!
//! Every lifecycle event, intercepted request and control message runs as
//! its own task. The dispatcher hands back a [`HoldOpen`] token that
//! resolves when the handler finishes; a handler that fails or panics is
//! logged and contained so the agent keeps serving later events.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, trace};

use super::messages::ControlMessage;
use super::worker::{CacheAgent, FetchOutcome, InstallReport};
use crate::origin::ResourceRequest;

/// Event delivered to an agent
#[derive(Debug)]
pub enum AgentEvent {
    Install,
    Activate,
    Fetch(ResourceRequest),
    Message(ControlMessage),
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Install => "install",
            AgentEvent::Activate => "activate",
            AgentEvent::Fetch(_) => "fetch",
            AgentEvent::Message(message) => message.kind(),
        }
    }
}

/// What a finished handler produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Installed(InstallReport),
    Activated { purged: Vec<String> },
    Fetched(FetchOutcome),
    MessageHandled,
}

/// Dispatcher error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("{event} handler failed: {reason}")]
    HandlerFailed { event: &'static str, reason: String },

    #[error("{event} handler panicked: {reason}")]
    Panicked { event: &'static str, reason: String },
}

/// Routes events to one agent's handlers
#[derive(Clone)]
pub struct EventDispatcher {
    agent: Arc<CacheAgent>,
}

impl EventDispatcher {
    pub fn new(agent: Arc<CacheAgent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<CacheAgent> {
        &self.agent
    }

    /// Start handling an event
    ///
    /// The handler runs whether or not the returned token is awaited.
    pub fn dispatch(&self, event: AgentEvent) -> HoldOpen {
        let agent = Arc::clone(&self.agent);
        let kind = event.kind();
        trace!(event = kind, version = %agent.version(), "Dispatching event");

        let handle = tokio::spawn(async move {
            let result = handle_event(&agent, event).await;
            if let Err(e) = &result {
                error!(version = %agent.version(), error = %e, "Agent event handler failed");
            }
            result
        });

        HoldOpen { event: kind, handle }
    }
}

async fn handle_event(agent: &CacheAgent, event: AgentEvent) -> Result<EventOutcome, DispatchError> {
    match event {
        AgentEvent::Install => Ok(EventOutcome::Installed(agent.install().await)),
        AgentEvent::Activate => {
            let purged = agent
                .activate()
                .await
                .map_err(|e| DispatchError::HandlerFailed {
                    event: "activate",
                    reason: e.to_string(),
                })?;
            Ok(EventOutcome::Activated { purged })
        }
        AgentEvent::Fetch(request) => Ok(EventOutcome::Fetched(agent.intercept(request).await)),
        AgentEvent::Message(message) => {
            agent.handle_message(message).await;
            Ok(EventOutcome::MessageHandled)
        }
    }
}

/// Keeps an event open until its handler completes
#[must_use = "dropping the token detaches the handler from its caller"]
pub struct HoldOpen {
    event: &'static str,
    handle: JoinHandle<Result<EventOutcome, DispatchError>>,
}

impl HoldOpen {
    #[cfg(test)]
    pub fn event(&self) -> &'static str {
        self.event
    }

    /// Wait for the handler to finish
    pub async fn wait(self) -> Result<EventOutcome, DispatchError> {
        let HoldOpen { event, handle } = self;
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(event, error = %e, "Uncaught agent error");
                Err(DispatchError::Panicked {
                    event,
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use reqwest::Url;

    use super::*;
    use crate::agent::manifest::Deployment;
    use crate::agent::worker::{AgentConfig, ResponseSource};
    use crate::store::{
        CachedEntry, GenerationHandle, MemoryStore, RequestKey, ResourceStore, StoreError,
    };
    use crate::testing::MockOrigin;

    /// Store whose lookups panic
    struct PanickingStore;

    #[async_trait]
    impl ResourceStore for PanickingStore {
        async fn open(&self, name: &str) -> Result<GenerationHandle, StoreError> {
            Ok(GenerationHandle::new(name))
        }

        async fn get(
            &self,
            _handle: &GenerationHandle,
            _key: &RequestKey,
        ) -> Result<Option<CachedEntry>, StoreError> {
            panic!("lookup exploded");
        }

        async fn put(&self, _handle: &GenerationHandle, _entry: CachedEntry) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete_generation(&self, _name: &str) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn generation_names(&self) -> Result<BTreeSet<String>, StoreError> {
            Ok(BTreeSet::new())
        }

        async fn entry_count(&self, _handle: &GenerationHandle) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    fn deployment() -> Deployment {
        crate::testing::deployment("1", &["/"], &[])
    }

    fn config() -> AgentConfig {
        AgentConfig {
            origin: Url::parse("http://localhost:8080").unwrap(),
            prefix: "offline-cache".into(),
            skip_waiting_on_install: true,
        }
    }

    fn get(path: &str) -> ResourceRequest {
        ResourceRequest::get(Url::parse("http://localhost:8080").unwrap().join(path).unwrap())
    }

    #[tokio::test]
    async fn test_hold_open_resolves_with_handler_result() {
        let store = Arc::new(MemoryStore::new());
        let origin = MockOrigin::new();
        origin.respond("/", 200, "root");
        let agent = Arc::new(CacheAgent::new(deployment(), &config(), store, origin));
        let dispatcher = EventDispatcher::new(agent);

        let installed = dispatcher.dispatch(AgentEvent::Install).wait().await.unwrap();
        match installed {
            EventOutcome::Installed(report) => assert_eq!(report.static_group.succeeded, 1),
            other => panic!("Unexpected outcome {:?}", other),
        }

        let token = dispatcher.dispatch(AgentEvent::Fetch(get("/")));
        assert_eq!(token.event(), "fetch");
        match token.wait().await.unwrap() {
            EventOutcome::Fetched(FetchOutcome::Response(response)) => {
                assert_eq!(response.source, ResponseSource::Store);
            }
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_activate_is_reported_and_contained() {
        let store = Arc::new(MemoryStore::new());
        let origin = MockOrigin::new();
        origin.respond("/api/ping", 200, "pong");
        let agent = Arc::new(CacheAgent::new(deployment(), &config(), store.clone(), origin));
        let dispatcher = EventDispatcher::new(agent);

        store.set_unavailable(true);
        let result = dispatcher.dispatch(AgentEvent::Activate).wait().await;
        assert!(matches!(
            result,
            Err(DispatchError::HandlerFailed { event: "activate", .. })
        ));

        let next = dispatcher.dispatch(AgentEvent::Fetch(get("/api/ping"))).wait().await;
        assert!(matches!(next, Ok(EventOutcome::Fetched(FetchOutcome::Response(_)))));
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_dispatcher() {
        let origin = MockOrigin::new();
        origin.respond("/api/ping", 200, "pong");
        let agent = Arc::new(CacheAgent::new(
            deployment(),
            &config(),
            Arc::new(PanickingStore),
            origin,
        ));
        let dispatcher = EventDispatcher::new(agent);

        let result = dispatcher.dispatch(AgentEvent::Fetch(get("/"))).wait().await;
        assert!(matches!(result, Err(DispatchError::Panicked { event: "fetch", .. })));

        let next = dispatcher.dispatch(AgentEvent::Fetch(get("/api/ping"))).wait().await;
        match next {
            Ok(EventOutcome::Fetched(FetchOutcome::Response(response))) => {
                assert_eq!(&response.body[..], b"pong");
            }
            other => panic!("Unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_event_is_handled() {
        let store = Arc::new(MemoryStore::new());
        let origin = MockOrigin::new();
        let agent = Arc::new(CacheAgent::new(deployment(), &config(), store, origin));
        let dispatcher = EventDispatcher::new(Arc::clone(&agent));

        let (reply, rx) = tokio::sync::oneshot::channel();
        let event = AgentEvent::Message(ControlMessage::StatusQuery { reply });
        assert_eq!(event.kind(), "status-query");

        let outcome = dispatcher.dispatch(event).wait().await.unwrap();
        assert_eq!(outcome, EventOutcome::MessageHandled);
        assert_eq!(rx.await.unwrap().static_count, 1);
    }
}
