//! Live-delivery sessions: at most one per connection, dropped when the
//! transport session underneath closes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relay_proto::protocols::pickup::PickupVersion;
use serde::{Deserialize, Serialize};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::debug;

use crate::{
    events::{AgentEvent, EventBus},
    shutdown::Shutdown,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PickupRole {
    Recipient,
    MessageHolder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePickupSession {
    pub id: String,
    pub connection_id: String,
    pub protocol_version: PickupVersion,
    pub role: PickupRole,
    pub transport_session_id: String,
}

pub struct PickupSessionService {
    /// Keyed by connection id.
    sessions: RwLock<HashMap<String, MessagePickupSession>>,
    events: EventBus,
}

impl PickupSessionService {
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Replaces any live session the connection already had.
    pub fn save_live_session(
        &self,
        connection_id: &str,
        transport_session_id: &str,
        protocol_version: PickupVersion,
        role: PickupRole,
    ) -> MessagePickupSession {
        let session = MessagePickupSession {
            id: uuid::Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            protocol_version,
            role,
            transport_session_id: transport_session_id.to_string(),
        };
        let replaced = self
            .sessions
            .write()
            .insert(connection_id.to_string(), session.clone());
        if let Some(old) = replaced {
            self.emit_removed(&old);
        }
        debug!(connection_id, transport_session_id, %protocol_version, ?role, "live session saved");
        self.events.emit(AgentEvent::LiveSessionSaved {
            connection_id: session.connection_id.clone(),
            session_id: session.id.clone(),
            protocol_version,
        });
        session
    }

    pub fn get_live_session(&self, connection_id: &str, role: Option<PickupRole>) -> Option<MessagePickupSession> {
        self.sessions
            .read()
            .get(connection_id)
            .filter(|s| role.map(|r| r == s.role).unwrap_or(true))
            .cloned()
    }

    pub fn remove_live_session(&self, connection_id: &str) -> Option<MessagePickupSession> {
        let removed = self.sessions.write().remove(connection_id);
        if let Some(session) = &removed {
            self.emit_removed(session);
        }
        removed
    }

    /// Drop every live session riding on `transport_session_id`.
    pub fn remove_by_transport_session(&self, transport_session_id: &str) -> Vec<MessagePickupSession> {
        let removed: Vec<MessagePickupSession> = {
            let mut sessions = self.sessions.write();
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.transport_session_id == transport_session_id)
                .map(|(connection_id, _)| connection_id.clone())
                .collect();
            stale.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &removed {
            self.emit_removed(session);
        }
        removed
    }

    pub fn spawn_listener(self: Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            let stop = shutdown.wait();
            tokio::pin!(stop);
            loop {
                let event = tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(AgentEvent::TransportSessionRemoved { session_id, .. }) => {
                        self.remove_by_transport_session(&session_id);
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn emit_removed(&self, session: &MessagePickupSession) {
        self.events.emit(AgentEvent::LiveSessionRemoved {
            connection_id: session.connection_id.clone(),
            session_id: session.id.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn closing_transport_session_drops_live_session() {
        let events = EventBus::new(16);
        let service = Arc::new(PickupSessionService::new(events.clone()));
        let shutdown = Shutdown::new();
        let listener = Arc::clone(&service).spawn_listener(shutdown.clone());

        service.save_live_session("c-1", "ts-1", PickupVersion::V2, PickupRole::MessageHolder);
        assert!(service.get_live_session("c-1", Some(PickupRole::MessageHolder)).is_some());
        assert!(service.get_live_session("c-1", Some(PickupRole::Recipient)).is_none());

        let waiter = events.waiter("live session removed", |e| match e {
            AgentEvent::LiveSessionRemoved { connection_id, .. } => Some(connection_id.clone()),
            _ => None,
        });
        events.emit(AgentEvent::TransportSessionRemoved {
            session_id: "ts-1".into(),
            connection_id: Some("c-1".into()),
            kind: "WebSocket".into(),
        });
        assert_eq!(waiter.wait(Duration::from_secs(1)).await.unwrap(), "c-1");
        assert!(service.get_live_session("c-1", None).is_none());

        shutdown.trigger();
        listener.await.unwrap();
    }
}
