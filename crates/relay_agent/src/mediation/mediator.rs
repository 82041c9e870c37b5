//! Mediator role: grant mediation, keep each recipient's keylist, and
//! deliver or queue forwards addressed to those keys.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_crypto::{keys::is_did_key, KeyStore, PublicKey};
use relay_proto::{
    protocols::{
        mediation::{
            KeylistUpdate, KeylistUpdateAction, KeylistUpdateResponse, KeylistUpdateResult, KeylistUpdated,
            MediationDeny, MediationGrant, MediationRequest,
        },
        problem_report::codes,
        routing::Forward,
    },
    AgentMessage,
};
use relay_store::{MediationRecord, MediationRepository, MediationRole, MediationState, MessageQueueStore};
use tracing::{debug, error, info};

use super::encode_key;
use crate::{
    config::{AgentConfig, ForwardingStrategy},
    connection::ConnectionService,
    dispatcher::OutboundDispatcher,
    error::AgentError,
    events::{AgentEvent, EventBus},
    inbound::InboundMessageContext,
    outbound::{OutboundMessageContext, SendStatus},
    pickup::MessagePickupApi,
};

pub struct MediatorService {
    repository: Arc<dyn MediationRepository>,
    queue: Arc<dyn MessageQueueStore>,
    connections: Arc<dyn ConnectionService>,
    dispatcher: Arc<OutboundDispatcher>,
    pickup: Arc<MessagePickupApi>,
    events: EventBus,
    config: Arc<AgentConfig>,
    routing_key: PublicKey,
    /// Per connection: whether the recipient's last keylist update named
    /// its keys as did:key.
    did_key_peers: RwLock<HashMap<String, bool>>,
}

impl MediatorService {
    /// Creates the routing key every grant advertises.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repository: Arc<dyn MediationRepository>,
        queue: Arc<dyn MessageQueueStore>,
        connections: Arc<dyn ConnectionService>,
        dispatcher: Arc<OutboundDispatcher>,
        pickup: Arc<MessagePickupApi>,
        keys: &dyn KeyStore,
        events: EventBus,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            repository,
            queue,
            connections,
            dispatcher,
            pickup,
            events,
            config,
            routing_key: keys.create_key(),
            did_key_peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn routing_key(&self) -> PublicKey {
        self.routing_key
    }

    /// `None` until the connection has sent a keylist update.
    pub fn uses_did_key(&self, connection_id: &str) -> Option<bool> {
        self.did_key_peers.read().get(connection_id).copied()
    }

    /// Store the request; with auto-accept on, also return the grant.
    pub async fn process_mediation_request(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<(MediationRecord, Option<OutboundMessageContext>), AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let _request: MediationRequest = ctx.message.body()?;

        let record = MediationRecord::new(MediationRole::Mediator, &connection.id, ctx.message.thread_id());
        self.repository.save(&record).await?;
        self.emit_state_changed(&record, None);
        info!(mediation_id = %record.id, connection_id = %connection.id, "mediation requested");

        if !self.config.auto_accept_mediation_requests {
            return Ok((record, None));
        }
        let (record, grant) = self.create_grant(&record.id).await?;
        Ok((record, Some(ctx.reply_with(grant))))
    }

    pub async fn create_grant(&self, mediation_id: &str) -> Result<(MediationRecord, AgentMessage), AgentError> {
        let mut record = self.repository.get_by_id(mediation_id).await?;
        record.assert_role(MediationRole::Mediator)?;
        record.assert_state(MediationState::Requested)?;
        let endpoint = self
            .config
            .endpoints
            .first()
            .cloned()
            .ok_or_else(|| AgentError::Config("a mediator needs at least one endpoint".into()))?;

        let previous = record.state;
        record.state = MediationState::Granted;
        record.routing_keys = vec![self.routing_key];
        record.endpoint = Some(endpoint.clone());
        record.touch();
        self.repository.save(&record).await?;
        self.emit_state_changed(&record, Some(previous));

        // First contact on this protocol falls back to the configured form.
        let did_key = self
            .uses_did_key(&record.connection_id)
            .unwrap_or(self.config.use_did_key_in_protocols);
        let grant = AgentMessage::new(&MediationGrant {
            endpoint,
            routing_keys: vec![encode_key(&self.routing_key, did_key)],
        })?
        .with_thread_id(record.thread_id.clone());
        Ok((record, grant))
    }

    pub async fn create_deny(&self, mediation_id: &str) -> Result<(MediationRecord, AgentMessage), AgentError> {
        let mut record = self.repository.get_by_id(mediation_id).await?;
        record.assert_role(MediationRole::Mediator)?;
        record.assert_state(MediationState::Requested)?;

        let previous = record.state;
        record.state = MediationState::Denied;
        record.touch();
        self.repository.save(&record).await?;
        self.emit_state_changed(&record, Some(previous));

        let deny = AgentMessage::new(&MediationDeny::default())?.with_thread_id(record.thread_id.clone());
        Ok((record, deny))
    }

    /// Apply the requested updates and answer with per-key results. The
    /// record is persisted before the response is built.
    pub async fn process_keylist_update_request(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<OutboundMessageContext, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let update: KeylistUpdate = ctx.message.body()?;
        let mut record = self
            .repository
            .find_by_connection_id(&connection.id)
            .await?
            .filter(|r| r.role == MediationRole::Mediator)
            .ok_or_else(|| AgentError::NotFound(format!("mediation record for connection {}", connection.id)))?;
        record.assert_state(MediationState::Granted)?;
        let did_key = update.updates.iter().any(|item| is_did_key(&item.recipient_key));
        self.did_key_peers.write().insert(connection.id.clone(), did_key);

        let mut updated: Vec<KeylistUpdated> = update
            .updates
            .into_iter()
            .map(|item| {
                let result = match PublicKey::parse(&item.recipient_key) {
                    Err(_) => KeylistUpdateResult::ClientError,
                    Ok(key) => match item.action {
                        KeylistUpdateAction::Add => {
                            record.add_recipient_key(key);
                            KeylistUpdateResult::Success
                        }
                        KeylistUpdateAction::Remove if record.remove_recipient_key(&key) => {
                            KeylistUpdateResult::Success
                        }
                        KeylistUpdateAction::Remove => KeylistUpdateResult::NoChange,
                    },
                };
                KeylistUpdated {
                    recipient_key: item.recipient_key,
                    action: item.action,
                    result,
                }
            })
            .collect();

        record.touch();
        if let Err(err) = self.repository.save(&record).await {
            error!(mediation_id = %record.id, error = %err, "persisting keylist failed");
            for entry in updated.iter_mut().filter(|u| u.result != KeylistUpdateResult::ClientError) {
                entry.result = KeylistUpdateResult::ServerError;
            }
        } else {
            self.events.emit(AgentEvent::KeylistUpdated {
                record: record.clone(),
                updated: updated.clone(),
            });
        }

        ctx.reply(&KeylistUpdateResponse { updated })
    }

    /// Route one forward to the recipient that registered its `to` key.
    pub async fn process_forward(&self, ctx: &InboundMessageContext) -> Result<SendStatus, AgentError> {
        let forward: Forward = ctx.message.body()?;
        let key = PublicKey::parse(&forward.to).map_err(|e| {
            AgentError::problem(codes::NOT_MEDIATED, format!("invalid forward target {}: {e}", forward.to))
        })?;
        let record = self
            .repository
            .find_by_recipient_key(MediationRole::Mediator, &key)
            .await?
            .ok_or_else(|| AgentError::problem(codes::NOT_MEDIATED, format!("no mediation for key {key}")))?;
        record.assert_state(MediationState::Granted)?;
        let connection = self.connections.get_by_id(&record.connection_id).await?;

        let mut recipient_dids = vec![key.to_did_key()];
        recipient_dids.extend(connection.their_did.clone());
        debug!(connection_id = %connection.id, strategy = ?self.config.mediator_forwarding_strategy, "forward");

        match self.config.mediator_forwarding_strategy {
            ForwardingStrategy::QueueOnly => {
                let message_id = self.queue.add_message(&connection.id, &recipient_dids, &forward.msg).await?;
                self.events.emit(AgentEvent::MessageQueued {
                    connection_id: connection.id.clone(),
                    message_id,
                });
                Ok(SendStatus::QueuedForPickup)
            }
            ForwardingStrategy::QueueAndLiveModeDelivery => {
                self.pickup
                    .queue_message(&connection.id, &recipient_dids, &forward.msg)
                    .await?;
                Ok(SendStatus::QueuedForPickup)
            }
            ForwardingStrategy::DirectDelivery => {
                self.dispatcher
                    .send_package(&connection, forward.msg, Some(&key))
                    .await
            }
        }
    }

    fn emit_state_changed(&self, record: &MediationRecord, previous_state: Option<MediationState>) {
        self.events.emit(AgentEvent::MediationStateChanged {
            record: record.clone(),
            previous_state,
        });
    }
}
