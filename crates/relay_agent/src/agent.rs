//! One agent instance: every service built once and wired by hand.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_crypto::{InMemoryKeyStore, KeyStore};
use relay_proto::EnvelopeCodec;
use relay_store::{
    InMemoryMediationRepository, InMemoryQueueStore, MediationRepository, MessageQueueStore, SqliteStore,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    config::AgentConfig,
    connection::{ConnectionService, InMemoryConnectionService},
    did::{DidResolver, StaticDidResolver},
    dispatcher::OutboundDispatcher,
    error::AgentError,
    events::EventBus,
    handler::HandlerRegistry,
    mediation::{MediationRecipientHandler, MediationRecipientService, MediatorHandler, MediatorService},
    pickup::{initiate_message_pickup, MessagePickupApi, PickupSessionService, PickupV1, PickupV2, PickupV3},
    receiver::MessageReceiver,
    shutdown::Shutdown,
    transport::{http::HttpOutboundTransport, ws::WsOutboundTransport, OutboundTransport, TransportSessionRegistry},
    trust_ping::TrustPingHandler,
};

/// Background loops get this long to notice shutdown before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Storage and identity backends the agent is built on.
#[derive(Clone)]
pub struct AgentDeps {
    pub key_store: Arc<dyn KeyStore>,
    pub connections: Arc<dyn ConnectionService>,
    pub resolver: Arc<dyn DidResolver>,
    pub queue: Arc<dyn MessageQueueStore>,
    pub mediation: Arc<dyn MediationRepository>,
}

impl AgentDeps {
    pub fn in_memory() -> Self {
        Self {
            key_store: Arc::new(InMemoryKeyStore::new()),
            connections: Arc::new(InMemoryConnectionService::new()),
            resolver: Arc::new(StaticDidResolver::new()),
            queue: Arc::new(InMemoryQueueStore::new()),
            mediation: Arc::new(InMemoryMediationRepository::new()),
        }
    }

    /// Queue and mediation records in SQLite at the configured path.
    pub async fn sqlite(config: &AgentConfig) -> Result<Self, AgentError> {
        let path = config.queue_database_path()?;
        let store = Arc::new(SqliteStore::open(&path).await?);
        info!(path = %path.display(), "opened queue database");
        Ok(Self {
            queue: Arc::clone(&store) as Arc<dyn MessageQueueStore>,
            mediation: store,
            ..Self::in_memory()
        })
    }
}

pub struct Agent {
    config: Arc<AgentConfig>,
    deps: AgentDeps,
    events: EventBus,
    shutdown: Shutdown,
    sessions: Arc<TransportSessionRegistry>,
    dispatcher: Arc<OutboundDispatcher>,
    handlers: Arc<HandlerRegistry>,
    receiver: Arc<MessageReceiver>,
    live_sessions: Arc<PickupSessionService>,
    pickup: Arc<MessagePickupApi>,
    recipient: Arc<MediationRecipientService>,
    mediator: Arc<MediatorService>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    /// Build without any outbound transports; see
    /// [`Agent::with_default_transports`].
    pub fn new(config: AgentConfig, deps: AgentDeps) -> Result<Self, AgentError> {
        config.validate()?;
        let config = Arc::new(config);
        let events = EventBus::new(config.event_capacity);
        let sessions = Arc::new(TransportSessionRegistry::new(events.clone()));

        let dispatcher = Arc::new(OutboundDispatcher::new(
            EnvelopeCodec::new(Arc::clone(&deps.key_store)),
            Arc::clone(&sessions),
            Arc::clone(&deps.resolver),
            Arc::clone(&deps.queue),
            events.clone(),
        ));
        let live_sessions = Arc::new(PickupSessionService::new(events.clone()));
        let pickup = Arc::new(MessagePickupApi::new(
            Arc::clone(&deps.queue),
            Arc::clone(&sessions),
            Arc::clone(&live_sessions),
            Arc::clone(&dispatcher),
            Arc::clone(&deps.connections),
            events.clone(),
            Arc::clone(&config),
        ));
        let recipient = Arc::new(MediationRecipientService::new(
            Arc::clone(&deps.mediation),
            Arc::clone(&deps.connections),
            Arc::clone(&dispatcher),
            Arc::clone(&deps.key_store),
            events.clone(),
            Arc::clone(&config),
        ));
        let mediator = Arc::new(MediatorService::new(
            Arc::clone(&deps.mediation),
            Arc::clone(&deps.queue),
            Arc::clone(&deps.connections),
            Arc::clone(&dispatcher),
            Arc::clone(&pickup),
            deps.key_store.as_ref(),
            events.clone(),
            Arc::clone(&config),
        ));

        let handlers = Arc::new(HandlerRegistry::new());
        handlers.register(Arc::new(TrustPingHandler))?;
        handlers.register(Arc::new(MediationRecipientHandler::new(Arc::clone(&recipient))))?;
        handlers.register(Arc::new(MediatorHandler::new(Arc::clone(&mediator))))?;
        handlers.register(Arc::new(PickupV1::new(
            Arc::clone(&deps.queue),
            events.clone(),
            Arc::clone(&config),
        )))?;
        handlers.register(Arc::new(PickupV2::new(
            Arc::clone(&deps.queue),
            Arc::clone(&live_sessions),
            events.clone(),
            Arc::clone(&config),
        )))?;
        handlers.register(Arc::new(PickupV3::new(
            Arc::clone(&deps.queue),
            Arc::clone(&live_sessions),
            events.clone(),
            Arc::clone(&config),
        )))?;

        let receiver = Arc::new(MessageReceiver::new(
            EnvelopeCodec::new(Arc::clone(&deps.key_store)),
            Arc::clone(&deps.connections),
            Arc::clone(&sessions),
            Arc::clone(&handlers),
            Arc::clone(&dispatcher),
            events.clone(),
            config.inbound_concurrency,
        ));

        Ok(Self {
            config,
            deps,
            events,
            shutdown: Shutdown::new(),
            sessions,
            dispatcher,
            handlers,
            receiver,
            live_sessions,
            pickup,
            recipient,
            mediator,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Register the HTTP and WebSocket transports.
    pub fn with_default_transports(self) -> Result<Self, AgentError> {
        let http = HttpOutboundTransport::new(self.events.clone())?;
        let ws = WsOutboundTransport::new(self.events.clone(), Arc::clone(&self.sessions));
        self.dispatcher.register_outbound_transport(Arc::new(http));
        self.dispatcher.register_outbound_transport(Arc::new(ws));
        Ok(self)
    }

    pub fn register_outbound_transport(&self, transport: Arc<dyn OutboundTransport>) {
        self.dispatcher.register_outbound_transport(transport);
    }

    /// Start listeners and transports.
    pub async fn start(&self) -> Result<(), AgentError> {
        for transport in self.dispatcher.outbound_transports() {
            transport.start().await?;
        }
        let mut tasks = self.tasks.lock();
        tasks.push(Arc::clone(&self.receiver).spawn_listener(self.shutdown.clone()));
        tasks.push(Arc::clone(&self.live_sessions).spawn_listener(self.shutdown.clone()));
        info!(label = %self.config.label, endpoints = ?self.config.endpoints, "agent started");
        Ok(())
    }

    /// Start pickup from the mediator of `mediation_id` with the
    /// configured strategy.
    pub async fn initiate_message_pickup(&self, mediation_id: &str) -> Result<(), AgentError> {
        let record = self.deps.mediation.get_by_id(mediation_id).await?;
        let handles = initiate_message_pickup(
            &self.pickup,
            &self.events,
            &record,
            self.config.mediator_pickup_strategy,
            &self.shutdown,
        )
        .await?;
        self.tasks.lock().extend(handles);
        Ok(())
    }

    /// Signal every loop, stop transports, then wait for the loops.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        for transport in self.dispatcher.outbound_transports() {
            if let Err(err) = transport.stop().await {
                warn!(error = %err, "transport stop failed");
            }
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("background task ignored shutdown; aborting");
                task.abort();
            }
        }
        info!(label = %self.config.label, "agent stopped");
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shutdown_signal(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.deps.key_store
    }

    pub fn connections(&self) -> &Arc<dyn ConnectionService> {
        &self.deps.connections
    }

    pub fn queue(&self) -> &Arc<dyn MessageQueueStore> {
        &self.deps.queue
    }

    pub fn mediation_repository(&self) -> &Arc<dyn MediationRepository> {
        &self.deps.mediation
    }

    pub fn sessions(&self) -> &Arc<TransportSessionRegistry> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<OutboundDispatcher> {
        &self.dispatcher
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn receiver(&self) -> &Arc<MessageReceiver> {
        &self.receiver
    }

    pub fn pickup(&self) -> &Arc<MessagePickupApi> {
        &self.pickup
    }

    pub fn live_sessions(&self) -> &Arc<PickupSessionService> {
        &self.live_sessions
    }

    pub fn mediation_recipient(&self) -> &Arc<MediationRecipientService> {
        &self.recipient
    }

    pub fn mediator(&self) -> &Arc<MediatorService> {
        &self.mediator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn starts_and_shuts_down_idempotently() {
        let agent = Agent::new(AgentConfig::default(), AgentDeps::in_memory()).unwrap();
        agent.start().await.unwrap();
        assert!(agent.events().receiver_count() >= 2);
        assert!(!agent.handlers().supported_keys().is_empty());

        agent.shutdown().await;
        agent.shutdown().await;
        assert!(agent.shutdown_signal().is_triggered());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = AgentConfig {
            maximum_message_pickup: 0,
            ..AgentConfig::default()
        };
        assert!(matches!(
            Agent::new(config, AgentDeps::in_memory()),
            Err(AgentError::Config(_))
        ));
    }
}
