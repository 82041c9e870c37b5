//! In-process event bus.
//!
//! Every service publishes to one [`EventBus`]. Correlated waits (grant,
//! keylist update, pickup completion) go through [`EventWaiter`], which
//! subscribes at creation so nothing published after the request is sent
//! can be missed, and drops its receiver on every exit path.
//!
//! Notifications are lossy: a slow subscriber lags and skips. Envelopes
//! bound for the receive pipeline travel on a separate bounded lane
//! ([`EventBus::deliver_inbound`]) that waits for room instead.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_proto::{protocols::pickup::PickupVersion, EncryptedMessage};
use relay_store::{MediationRecord, MediationState};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tracing::{debug, warn};

use crate::{error::AgentError, outbound::SendStatus};

#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Terminal outcome of one `send_message` call.
    MessageSent {
        message_id: String,
        connection_id: Option<String>,
        status: SendStatus,
    },
    /// An encrypted envelope arrived (inbound socket, HTTP response body or
    /// pickup delivery) and was handed to the receive pipeline.
    MessageReceived {
        envelope: EncryptedMessage,
        session_id: Option<String>,
        connection_id: Option<String>,
    },
    TransportSessionSaved {
        session_id: String,
        connection_id: Option<String>,
        kind: String,
    },
    TransportSessionRemoved {
        session_id: String,
        connection_id: Option<String>,
        kind: String,
    },
    OutboundSessionOpened {
        endpoint: String,
        connection_id: Option<String>,
    },
    OutboundSessionClosed {
        endpoint: String,
        connection_id: Option<String>,
    },
    MediationStateChanged {
        record: MediationRecord,
        previous_state: Option<MediationState>,
    },
    KeylistUpdated {
        record: MediationRecord,
        updated: Vec<relay_proto::protocols::mediation::KeylistUpdated>,
    },
    MessageQueued {
        connection_id: String,
        message_id: String,
    },
    LiveSessionSaved {
        connection_id: String,
        session_id: String,
        protocol_version: PickupVersion,
    },
    LiveSessionRemoved {
        connection_id: String,
        session_id: String,
    },
    /// The recipient side finished draining its mailbox for this cycle.
    MessagePickupCompleted {
        connection_id: String,
        thread_id: Option<String>,
    },
}

impl AgentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::MessageSent { .. } => "MessageSent",
            AgentEvent::MessageReceived { .. } => "MessageReceived",
            AgentEvent::TransportSessionSaved { .. } => "TransportSessionSaved",
            AgentEvent::TransportSessionRemoved { .. } => "TransportSessionRemoved",
            AgentEvent::OutboundSessionOpened { .. } => "OutboundSessionOpened",
            AgentEvent::OutboundSessionClosed { .. } => "OutboundSessionClosed",
            AgentEvent::MediationStateChanged { .. } => "MediationStateChanged",
            AgentEvent::KeylistUpdated { .. } => "KeylistUpdated",
            AgentEvent::MessageQueued { .. } => "MessageQueued",
            AgentEvent::LiveSessionSaved { .. } => "LiveSessionSaved",
            AgentEvent::LiveSessionRemoved { .. } => "LiveSessionRemoved",
            AgentEvent::MessagePickupCompleted { .. } => "MessagePickupCompleted",
        }
    }
}

/// One envelope waiting for the receive pipeline.
#[derive(Debug, Clone)]
pub struct InboundEnvelope {
    pub envelope: EncryptedMessage,
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    inbound_rx: Arc<Mutex<Option<mpsc::Receiver<InboundEnvelope>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
        }
    }

    /// Publishing with no subscribers is not an error.
    pub fn emit(&self, event: AgentEvent) {
        debug!(event = event.name(), "emit");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }

    /// Hand an envelope to the receive pipeline, waiting while it is full.
    /// Once this returns the envelope is owned by the pipeline; a
    /// [`AgentEvent::MessageReceived`] notification follows.
    pub async fn deliver_inbound(&self, inbound: InboundEnvelope) -> Result<(), AgentError> {
        let notice = AgentEvent::MessageReceived {
            envelope: inbound.envelope.clone(),
            session_id: inbound.session_id.clone(),
            connection_id: inbound.connection_id.clone(),
        };
        self.inbound_tx
            .send(inbound)
            .await
            .map_err(|_| AgentError::Transport("receive pipeline is closed".into()))?;
        self.emit(notice);
        Ok(())
    }

    /// The consuming end of the inbound lane. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundEnvelope>> {
        self.inbound_rx.lock().take()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Subscribe now; the first event for which `select` returns `Some`
    /// resolves [`EventWaiter::wait`].
    pub fn waiter<T, F>(&self, waiting_for: impl Into<String>, select: F) -> EventWaiter<T>
    where
        F: FnMut(&AgentEvent) -> Option<T> + Send + 'static,
    {
        EventWaiter {
            rx: self.tx.subscribe(),
            select: Box::new(select),
            waiting_for: waiting_for.into(),
        }
    }
}

pub struct EventWaiter<T> {
    rx: broadcast::Receiver<AgentEvent>,
    select: Box<dyn FnMut(&AgentEvent) -> Option<T> + Send>,
    waiting_for: String,
}

impl<T> EventWaiter<T> {
    pub async fn wait(mut self, timeout: Duration) -> Result<T, AgentError> {
        let waiting_for = std::mem::take(&mut self.waiting_for);
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                match self.rx.recv().await {
                    Ok(event) => {
                        if let Some(found) = (self.select)(&event) {
                            return Ok(found);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, waiting_for = %waiting_for, "event waiter lagged");
                    }
                    Err(RecvError::Closed) => {
                        return Err(AgentError::NotFound(format!(
                            "event bus closed while waiting for {waiting_for}"
                        )))
                    }
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout {
                after: timeout,
                waiting_for,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(connection_id: &str) -> AgentEvent {
        AgentEvent::MessageQueued {
            connection_id: connection_id.into(),
            message_id: "m-1".into(),
        }
    }

    #[tokio::test]
    async fn waiter_filters_and_unsubscribes() {
        let bus = EventBus::new(16);
        let waiter = bus.waiter("queued for c-2", |event| match event {
            AgentEvent::MessageQueued { connection_id, message_id } if connection_id == "c-2" => {
                Some(message_id.clone())
            }
            _ => None,
        });
        assert_eq!(bus.receiver_count(), 1);

        bus.emit(queued("c-1"));
        bus.emit(queued("c-2"));
        let id = waiter.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(id, "m-1");
        assert_eq!(bus.receiver_count(), 0);
    }

    fn inbound(n: u8) -> InboundEnvelope {
        InboundEnvelope {
            envelope: EncryptedMessage {
                protected: "e30".into(),
                iv: "aXY".into(),
                ciphertext: format!("ct-{n}"),
                tag: "dGFn".into(),
            },
            session_id: None,
            connection_id: Some(format!("c-{n}")),
        }
    }

    #[tokio::test]
    async fn inbound_lane_keeps_every_envelope_past_capacity() {
        let bus = EventBus::new(4);
        let mut rx = bus.take_inbound().unwrap();
        assert!(bus.take_inbound().is_none());

        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for n in 0..10 {
                    bus.deliver_inbound(inbound(n)).await.unwrap();
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 10 {
            seen.push(rx.recv().await.unwrap().connection_id.unwrap());
        }
        producer.await.unwrap();
        let expected: Vec<String> = (0..10).map(|n| format!("c-{n}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn full_inbound_lane_holds_the_producer_back() {
        let bus = EventBus::new(2);
        let _rx = bus.take_inbound().unwrap();
        bus.deliver_inbound(inbound(0)).await.unwrap();
        bus.deliver_inbound(inbound(1)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_secs(1), bus.deliver_inbound(inbound(2))).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_without_leaking() {
        let bus = EventBus::new(16);
        let waiter = bus.waiter("nothing", |_| Some(()));
        let err = waiter.wait(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { after, .. } if after == Duration::from_secs(5)));
        assert_eq!(bus.receiver_count(), 0);
    }
}
