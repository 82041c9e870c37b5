//! Recipient role: ask a mediator to route for us, keep its keylist in sync.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use relay_crypto::{keys::is_did_key, KeyStore, PublicKey};
use relay_proto::{
    protocols::mediation::{
        KeylistUpdate, KeylistUpdateAction, KeylistUpdateItem, KeylistUpdateResponse, KeylistUpdateResult,
        MediationDeny, MediationGrant, MediationRequest,
    },
    AgentMessage,
};
use relay_store::{MediationRecord, MediationRepository, MediationRole, MediationState};
use tracing::{debug, info, warn};

use super::{encode_key, Routing};
use crate::{
    config::AgentConfig,
    connection::{ConnectionRecord, ConnectionService},
    dispatcher::OutboundDispatcher,
    error::AgentError,
    events::{AgentEvent, EventBus},
    inbound::InboundMessageContext,
    outbound::OutboundMessageContext,
};

pub struct MediationRecipientService {
    repository: Arc<dyn MediationRepository>,
    connections: Arc<dyn ConnectionService>,
    dispatcher: Arc<OutboundDispatcher>,
    keys: Arc<dyn KeyStore>,
    events: EventBus,
    config: Arc<AgentConfig>,
    /// Connections whose mediator used did:key in its grant.
    did_key_peers: RwLock<HashSet<String>>,
}

impl MediationRecipientService {
    pub fn new(
        repository: Arc<dyn MediationRepository>,
        connections: Arc<dyn ConnectionService>,
        dispatcher: Arc<OutboundDispatcher>,
        keys: Arc<dyn KeyStore>,
        events: EventBus,
        config: Arc<AgentConfig>,
    ) -> Self {
        Self {
            repository,
            connections,
            dispatcher,
            keys,
            events,
            config,
            did_key_peers: RwLock::new(HashSet::new()),
        }
    }

    /// New `Requested` record plus the request message; nothing is sent.
    pub async fn create_request(
        &self,
        connection: &ConnectionRecord,
    ) -> Result<(MediationRecord, AgentMessage), AgentError> {
        connection.assert_ready()?;
        let message = AgentMessage::new(&MediationRequest::default())?;
        let record = MediationRecord::new(MediationRole::Recipient, &connection.id, message.thread_id());
        self.repository.save(&record).await?;
        self.emit_state_changed(&record, None);
        Ok((record, message))
    }

    pub async fn request_mediation(&self, connection: &ConnectionRecord) -> Result<MediationRecord, AgentError> {
        let (record, message) = self.create_request(connection).await?;
        self.dispatcher
            .send_message(OutboundMessageContext::for_connection(message, connection.clone()), None)
            .await?;
        Ok(record)
    }

    /// Request mediation and wait for the grant or deny. A `Denied` record
    /// is returned as `Ok`; only the wait itself can time out.
    pub async fn request_and_await_grant(
        &self,
        connection: &ConnectionRecord,
        timeout: Option<Duration>,
    ) -> Result<MediationRecord, AgentError> {
        let (record, message) = self.create_request(connection).await?;
        let record_id = record.id.clone();
        let waiter = self.events.waiter(format!("mediation grant for {record_id}"), move |event| match event {
            AgentEvent::MediationStateChanged { record, .. }
                if record.id == record_id && record.state != MediationState::Requested =>
            {
                Some(record.clone())
            }
            _ => None,
        });
        self.dispatcher
            .send_message(OutboundMessageContext::for_connection(message, connection.clone()), None)
            .await?;
        waiter
            .wait(timeout.unwrap_or_else(|| self.config.mediation_grant_timeout()))
            .await
    }

    pub async fn process_grant(&self, ctx: &InboundMessageContext) -> Result<MediationRecord, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let grant: MediationGrant = ctx.message.body()?;
        let mut record = self.record_for(&connection.id).await?;
        record.assert_role(MediationRole::Recipient)?;
        record.assert_state(MediationState::Requested)?;

        // Mediators disagree on encoding; store raw keys either way.
        let routing_keys = grant
            .routing_keys
            .iter()
            .map(|k| PublicKey::parse(k))
            .collect::<Result<Vec<_>, _>>()?;
        if grant.routing_keys.iter().any(|k| is_did_key(k)) {
            self.did_key_peers.write().insert(connection.id.clone());
        }

        let previous = record.state;
        record.routing_keys = routing_keys;
        record.endpoint = Some(grant.endpoint);
        record.state = MediationState::Granted;
        record.touch();
        self.repository.save(&record).await?;
        info!(mediation_id = %record.id, connection_id = %connection.id, "mediation granted");
        self.emit_state_changed(&record, Some(previous));
        Ok(record)
    }

    pub async fn process_deny(&self, ctx: &InboundMessageContext) -> Result<MediationRecord, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let _deny: MediationDeny = ctx.message.body()?;
        let mut record = self.record_for(&connection.id).await?;
        record.assert_role(MediationRole::Recipient)?;
        record.assert_state(MediationState::Requested)?;

        let previous = record.state;
        record.state = MediationState::Denied;
        record.touch();
        self.repository.save(&record).await?;
        info!(mediation_id = %record.id, connection_id = %connection.id, "mediation denied");
        self.emit_state_changed(&record, Some(previous));
        Ok(record)
    }

    pub fn create_keylist_update(
        &self,
        record: &MediationRecord,
        key: &PublicKey,
        action: KeylistUpdateAction,
    ) -> Result<AgentMessage, AgentError> {
        let did_key = self.did_key_peers.read().contains(&record.connection_id);
        Ok(AgentMessage::new(&KeylistUpdate {
            updates: vec![KeylistUpdateItem {
                recipient_key: encode_key(key, did_key),
                action,
            }],
        })?)
    }

    /// Send one keylist update and wait for the mediator's response.
    ///
    /// On timeout the local record is left as it was, even though the
    /// mediator may have applied the update.
    pub async fn keylist_update_and_await(
        &self,
        mediation_id: &str,
        key: &PublicKey,
        action: KeylistUpdateAction,
        timeout: Option<Duration>,
    ) -> Result<MediationRecord, AgentError> {
        let record = self.repository.get_by_id(mediation_id).await?;
        record.assert_role(MediationRole::Recipient)?;
        record.assert_state(MediationState::Granted)?;
        let connection = self.connections.get_by_id(&record.connection_id).await?;
        let message = self.create_keylist_update(&record, key, action)?;

        let record_id = record.id.clone();
        let waiter = self.events.waiter(format!("keylist update for {record_id}"), move |event| match event {
            AgentEvent::KeylistUpdated { record, .. } if record.id == record_id => Some(record.clone()),
            _ => None,
        });
        self.dispatcher
            .send_message(OutboundMessageContext::for_connection(message, connection), None)
            .await?;
        waiter
            .wait(timeout.unwrap_or_else(|| self.config.keylist_update_timeout()))
            .await
    }

    pub async fn process_keylist_update_results(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<MediationRecord, AgentError> {
        let connection = ctx.assert_ready_connection()?;
        let response: KeylistUpdateResponse = ctx.message.body()?;
        let mut record = self.record_for(&connection.id).await?;
        record.assert_role(MediationRole::Recipient)?;
        record.assert_state(MediationState::Granted)?;

        for update in &response.updated {
            let key = match PublicKey::parse(&update.recipient_key) {
                Ok(key) => key,
                Err(err) => {
                    warn!(key = %update.recipient_key, error = %err, "unparseable key in keylist response");
                    continue;
                }
            };
            match (update.result, update.action) {
                (KeylistUpdateResult::Success | KeylistUpdateResult::NoChange, KeylistUpdateAction::Add) => {
                    record.add_recipient_key(key);
                }
                (KeylistUpdateResult::Success | KeylistUpdateResult::NoChange, KeylistUpdateAction::Remove) => {
                    record.remove_recipient_key(&key);
                }
                (result, action) => {
                    warn!(key = %key, ?result, ?action, mediation_id = %record.id, "keylist update rejected")
                }
            }
        }
        record.touch();
        self.repository.save(&record).await?;
        self.events.emit(AgentEvent::KeylistUpdated {
            record: record.clone(),
            updated: response.updated,
        });
        Ok(record)
    }

    /// Register `routing.recipient_key` with the mediator and route through
    /// it: its routing keys go first, its endpoint replaces ours.
    pub async fn add_mediation_routing(
        &self,
        mut routing: Routing,
        mediator_id: Option<&str>,
    ) -> Result<Routing, AgentError> {
        let mediator = match mediator_id {
            Some(id) => Some(self.repository.get_by_id(id).await?),
            None => self.find_default_mediator().await?,
        };
        let Some(mediator) = mediator else {
            return Ok(routing);
        };

        let mediator = self
            .keylist_update_and_await(&mediator.id, &routing.recipient_key, KeylistUpdateAction::Add, None)
            .await?;
        let mut routing_keys = mediator.routing_keys.clone();
        routing_keys.extend(routing.routing_keys);
        routing.routing_keys = routing_keys;
        if let Some(endpoint) = &mediator.endpoint {
            routing.endpoints = vec![endpoint.clone()];
        }
        routing.mediator_id = Some(mediator.id);
        Ok(routing)
    }

    pub async fn remove_mediation_routing(&self, routing: &Routing) -> Result<Option<MediationRecord>, AgentError> {
        let Some(mediator_id) = &routing.mediator_id else {
            return Ok(None);
        };
        let record = self
            .keylist_update_and_await(mediator_id, &routing.recipient_key, KeylistUpdateAction::Remove, None)
            .await?;
        Ok(Some(record))
    }

    /// Fresh recipient key, routed through the default mediator when asked.
    pub async fn get_routing(&self, use_default_mediator: bool) -> Result<Routing, AgentError> {
        let routing = Routing {
            endpoints: self.config.endpoints.clone(),
            recipient_key: self.keys.create_key(),
            routing_keys: vec![],
            mediator_id: None,
        };
        if !use_default_mediator {
            return Ok(routing);
        }
        self.add_mediation_routing(routing, None).await
    }

    pub async fn find_default_mediator(&self) -> Result<Option<MediationRecord>, AgentError> {
        Ok(self
            .repository
            .find_default()
            .await?
            .filter(|r| r.role == MediationRole::Recipient && r.is_ready()))
    }

    pub async fn set_default_mediator(&self, mediation_id: &str) -> Result<MediationRecord, AgentError> {
        let mut record = self.repository.get_by_id(mediation_id).await?;
        record.assert_role(MediationRole::Recipient)?;
        record.assert_state(MediationState::Granted)?;
        self.clear_default_mediator().await?;
        record.is_default = true;
        record.touch();
        self.repository.save(&record).await?;
        debug!(mediation_id, "default mediator set");
        Ok(record)
    }

    pub async fn clear_default_mediator(&self) -> Result<(), AgentError> {
        for mut record in self.repository.get_all().await?.into_iter().filter(|r| r.is_default) {
            record.is_default = false;
            record.touch();
            self.repository.save(&record).await?;
        }
        Ok(())
    }

    pub async fn get_mediators(&self) -> Result<Vec<MediationRecord>, AgentError> {
        Ok(self
            .repository
            .get_all()
            .await?
            .into_iter()
            .filter(|r| r.role == MediationRole::Recipient)
            .collect())
    }

    pub fn uses_did_key(&self, connection_id: &str) -> bool {
        self.did_key_peers.read().contains(connection_id)
    }

    async fn record_for(&self, connection_id: &str) -> Result<MediationRecord, AgentError> {
        self.repository
            .find_by_connection_id(connection_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("mediation record for connection {connection_id}")))
    }

    fn emit_state_changed(&self, record: &MediationRecord, previous_state: Option<MediationState>) {
        self.events.emit(AgentEvent::MediationStateChanged {
            record: record.clone(),
            previous_state,
        });
    }
}
