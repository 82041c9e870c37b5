//! Live sessions, by id and by connection.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use super::TransportSession;
use crate::events::{AgentEvent, EventBus};

struct Entry {
    session: Arc<TransportSession>,
    /// Save order; newest wins on connection lookups.
    seq: u64,
}

pub struct TransportSessionRegistry {
    sessions: RwLock<(u64, HashMap<String, Entry>)>,
    events: EventBus,
}

impl TransportSessionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            sessions: RwLock::new((0, HashMap::new())),
            events,
        }
    }

    /// Register `session`. Any other session of the same kind for the same
    /// connection is closed and removed first.
    pub async fn save(&self, session: Arc<TransportSession>) {
        let connection_id = session.connection_id();
        let superseded: Vec<Arc<TransportSession>> = {
            let mut guard = self.sessions.write();
            let (seq, sessions) = &mut *guard;
            let stale: Vec<String> = match &connection_id {
                Some(connection_id) => sessions
                    .values()
                    .filter(|e| {
                        e.session.id != session.id
                            && e.session.kind == session.kind
                            && e.session.connection_id().as_deref() == Some(connection_id.as_str())
                    })
                    .map(|e| e.session.id.clone())
                    .collect(),
                None => vec![],
            };
            *seq += 1;
            sessions.insert(
                session.id.clone(),
                Entry {
                    session: Arc::clone(&session),
                    seq: *seq,
                },
            );
            stale
                .iter()
                .filter_map(|id| sessions.remove(id))
                .map(|e| e.session)
                .collect()
        };

        for old in superseded {
            debug!(session_id = %old.id, replaced_by = %session.id, "closing superseded session");
            if let Err(err) = old.close().await {
                warn!(session_id = %old.id, error = %err, "closing superseded session failed");
            }
            self.emit_removed(&old);
        }

        self.events.emit(AgentEvent::TransportSessionSaved {
            session_id: session.id.clone(),
            connection_id,
            kind: session.kind.clone(),
        });
    }

    pub fn find_by_id(&self, session_id: &str) -> Option<Arc<TransportSession>> {
        self.sessions.read().1.get(session_id).map(|e| Arc::clone(&e.session))
    }

    /// Most recently saved session for the connection, of any kind.
    pub fn find_by_connection_id(&self, connection_id: &str) -> Option<Arc<TransportSession>> {
        self.sessions
            .read()
            .1
            .values()
            .filter(|e| e.session.connection_id().as_deref() == Some(connection_id))
            .max_by_key(|e| e.seq)
            .map(|e| Arc::clone(&e.session))
    }

    /// Deregister without closing. Returns `false` if it was not
    /// registered, in which case no event is emitted.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().1.remove(session_id);
        match removed {
            Some(entry) => {
                self.emit_removed(&entry.session);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn emit_removed(&self, session: &TransportSession) {
        self.events.emit(AgentEvent::TransportSessionRemoved {
            session_id: session.id.clone(),
            connection_id: session.connection_id(),
            kind: session.kind.clone(),
        });
    }
}
