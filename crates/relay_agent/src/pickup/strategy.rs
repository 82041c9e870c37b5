//! Start the recipient-side pickup loop for a granted mediation.

use std::sync::Arc;

use async_trait::async_trait;
use relay_proto::{
    protocols::{pickup::PickupVersion, trust_ping::TrustPing},
    AgentMessage, ReturnRoute,
};
use relay_store::{MediationRecord, MediationRole, MediationState};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    api::{MessagePickupApi, PickupRequest},
    backoff::{BackoffPolicy, ReconnectAction, ReconnectBackoffManager},
};
use crate::{
    config::PickupStrategy,
    error::AgentError,
    events::EventBus,
    outbound::{OutboundMessageContext, TransportPriority},
    shutdown::Shutdown,
};

/// Re-open live mode: status-request, then live-delivery-change.
struct LiveModeReconnect {
    api: Arc<MessagePickupApi>,
    connection_id: String,
}

impl LiveModeReconnect {
    async fn open(&self) -> Result<(), AgentError> {
        self.api
            .pickup_messages(PickupRequest::new(&self.connection_id, PickupVersion::V2))
            .await?;
        self.api
            .set_live_delivery_mode(&self.connection_id, PickupVersion::V2, true)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReconnectAction for LiveModeReconnect {
    async fn reconnect(&self) -> Result<(), AgentError> {
        self.open().await
    }
}

/// Keep a socket open by pinging with return routing; the mediator
/// answers over it and pushes whatever is queued.
struct ImplicitReconnect {
    api: Arc<MessagePickupApi>,
    connection_id: String,
}

impl ImplicitReconnect {
    async fn ping(&self) -> Result<(), AgentError> {
        let connection = self.api.connections().get_by_id(&self.connection_id).await?;
        let mut message = AgentMessage::new(&TrustPing {
            response_requested: false,
            comment: None,
        })?;
        message.set_return_route(ReturnRoute::All);
        let ctx = OutboundMessageContext::for_connection(message, connection).without_queue();
        self.api
            .dispatcher()
            .send_message(ctx, Some(TransportPriority::new(["wss", "ws"], true)))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ReconnectAction for ImplicitReconnect {
    async fn reconnect(&self) -> Result<(), AgentError> {
        self.ping().await
    }
}

fn reconnect_policy(api: &MessagePickupApi) -> BackoffPolicy {
    BackoffPolicy {
        base: api.config().reconnect_base(),
        max: api.config().reconnect_max(),
    }
}

fn spawn_polling(
    api: Arc<MessagePickupApi>,
    connection_id: String,
    protocol: PickupVersion,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    let period = api.config().polling_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let stop = shutdown.wait();
        tokio::pin!(stop);

        loop {
            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }
            debug!(%connection_id, %protocol, "polling mediator");
            if let Err(err) = api.pickup_messages(PickupRequest::new(&connection_id, protocol)).await {
                warn!(%connection_id, error = %err, "pickup poll failed");
            }
        }
        debug!(%connection_id, "polling stopped");
    })
}

/// Handles are returned so the caller can await them after shutdown.
pub async fn initiate_message_pickup(
    api: &Arc<MessagePickupApi>,
    events: &EventBus,
    record: &MediationRecord,
    strategy: PickupStrategy,
    shutdown: &Shutdown,
) -> Result<Vec<JoinHandle<()>>, AgentError> {
    record.assert_role(MediationRole::Recipient)?;
    record.assert_state(MediationState::Granted)?;
    let connection_id = record.connection_id.clone();
    info!(%connection_id, ?strategy, "starting message pickup");

    let handles = match strategy {
        PickupStrategy::PickUpV1 => vec![spawn_polling(
            Arc::clone(api),
            connection_id,
            PickupVersion::V1,
            shutdown.clone(),
        )],
        PickupStrategy::PickUpV2 => vec![spawn_polling(
            Arc::clone(api),
            connection_id,
            PickupVersion::V2,
            shutdown.clone(),
        )],
        PickupStrategy::PickUpV2LiveMode => {
            let action = Arc::new(LiveModeReconnect {
                api: Arc::clone(api),
                connection_id: connection_id.clone(),
            });
            let monitor = ReconnectBackoffManager::new(
                &connection_id,
                reconnect_policy(api),
                events.clone(),
                Arc::clone(&action) as Arc<dyn ReconnectAction>,
                shutdown.clone(),
            )
            .spawn();
            action.open().await?;
            vec![monitor]
        }
        PickupStrategy::Implicit => {
            let action = Arc::new(ImplicitReconnect {
                api: Arc::clone(api),
                connection_id: connection_id.clone(),
            });
            let monitor = ReconnectBackoffManager::new(
                &connection_id,
                reconnect_policy(api),
                events.clone(),
                Arc::clone(&action) as Arc<dyn ReconnectAction>,
                shutdown.clone(),
            )
            .spawn();
            action.ping().await?;
            vec![monitor]
        }
        PickupStrategy::None => Vec::new(),
    };
    Ok(handles)
}
