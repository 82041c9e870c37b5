//! Reconnect with exponential backoff after a persistent outbound session
//! drops. Delays run base, 2×base, 4×base … capped at max, and reset once
//! a session for the connection opens again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    error::AgentError,
    events::{AgentEvent, EventBus},
    shutdown::Shutdown,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            base: policy.base,
            max: policy.max,
            current: policy.base,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.max);
        self.current = std::cmp::min(next, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

/// Re-establishes the session, e.g. by re-sending whatever opened it.
#[async_trait]
pub trait ReconnectAction: Send + Sync {
    async fn reconnect(&self) -> Result<(), AgentError>;
}

pub struct ReconnectBackoffManager {
    connection_id: String,
    policy: BackoffPolicy,
    events: EventBus,
    action: Arc<dyn ReconnectAction>,
    shutdown: Shutdown,
}

impl ReconnectBackoffManager {
    pub fn new(
        connection_id: impl Into<String>,
        policy: BackoffPolicy,
        events: EventBus,
        action: Arc<dyn ReconnectAction>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            policy,
            events,
            action,
            shutdown,
        }
    }

    /// The subscription is taken before the task starts, so no close
    /// emitted after this call is missed.
    pub fn spawn(self) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            let mut backoff = Backoff::new(self.policy);
            let stop = self.shutdown.wait();
            tokio::pin!(stop);

            loop {
                let event = tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(AgentEvent::OutboundSessionOpened { connection_id, .. })
                        if connection_id.as_deref() == Some(self.connection_id.as_str()) =>
                    {
                        backoff.reset();
                    }
                    Ok(AgentEvent::OutboundSessionClosed { connection_id, endpoint })
                        if connection_id.as_deref() == Some(self.connection_id.as_str()) =>
                    {
                        info!(connection_id = %self.connection_id, %endpoint, "session closed; reconnecting");
                        loop {
                            let delay = backoff.next_delay();
                            debug!(connection_id = %self.connection_id, ?delay, "reconnect scheduled");
                            tokio::select! {
                                biased;
                                _ = &mut stop => return,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            match self.action.reconnect().await {
                                Ok(()) => break,
                                Err(err) => {
                                    warn!(connection_id = %self.connection_id, error = %err, "reconnect failed")
                                }
                            }
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
