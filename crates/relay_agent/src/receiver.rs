//! Inbound pipeline.
//!
//! decrypt → find connection → record return route on the session →
//! dispatch to the registered handler → send the handler's response.
//!
//! Envelopes arrive on the event bus's inbound lane; how many are
//! processed at once is bounded by a semaphore (one permit in
//! [`Concurrency::Serial`] mode).

use std::sync::Arc;

use relay_proto::{
    protocols::problem_report::{codes, ProblemReport},
    EncryptedMessage, EnvelopeCodec, EnvelopeKeys,
};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::Concurrency,
    connection::ConnectionService,
    dispatcher::OutboundDispatcher,
    error::AgentError,
    events::{EventBus, InboundEnvelope},
    handler::HandlerRegistry,
    inbound::InboundMessageContext,
    problem_report::problem_report_for,
    shutdown::Shutdown,
    transport::TransportSessionRegistry,
};

pub struct MessageReceiver {
    codec: EnvelopeCodec,
    connections: Arc<dyn ConnectionService>,
    sessions: Arc<TransportSessionRegistry>,
    handlers: Arc<HandlerRegistry>,
    dispatcher: Arc<OutboundDispatcher>,
    events: EventBus,
    gate: Arc<Semaphore>,
}

impl MessageReceiver {
    pub fn new(
        codec: EnvelopeCodec,
        connections: Arc<dyn ConnectionService>,
        sessions: Arc<TransportSessionRegistry>,
        handlers: Arc<HandlerRegistry>,
        dispatcher: Arc<OutboundDispatcher>,
        events: EventBus,
        concurrency: Concurrency,
    ) -> Self {
        let permits = match concurrency {
            Concurrency::Serial => 1,
            Concurrency::Concurrent => Semaphore::MAX_PERMITS,
        };
        Self {
            codec,
            connections,
            sessions,
            handlers,
            dispatcher,
            events,
            gate: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Decrypt and process one envelope.
    ///
    /// An undecryptable envelope is an `Err` and nothing else happens.
    pub async fn receive(
        &self,
        envelope: &EncryptedMessage,
        session_id: Option<&str>,
        connection_hint: Option<&str>,
    ) -> Result<(), AgentError> {
        let decrypted = self.codec.unpack(envelope)?;
        let message = decrypted.plaintext;
        debug!(message_id = %message.id, message_type = %message.message_type, "received");

        let mut connection = self
            .connections
            .find_by_keys(&decrypted.recipient_key, decrypted.sender_key.as_ref())
            .await?;
        if connection.is_none() {
            if let Some(hint) = connection_hint {
                connection = self.connections.get_by_id(hint).await.ok();
            }
        }

        // A session is only worth keeping when the peer may be answered on
        // it: an authenticated sender that asked for return routing.
        let session = match (session_id.and_then(|id| self.sessions.find_by_id(id)), decrypted.sender_key) {
            (Some(open), Some(sender_key)) if message.has_any_return_route() => {
                debug!(message_id = %message.id, session_id = %open.id, "storing session for return route");
                open.set_keys(EnvelopeKeys {
                    recipient_keys: vec![sender_key],
                    routing_keys: vec![],
                    sender_key: Some(decrypted.recipient_key),
                });
                open.set_inbound_transport(message.transport.clone());
                if let Some(connection) = &connection {
                    open.set_connection_id(connection.id.clone());
                }
                self.sessions.save(Arc::clone(&open)).await;
                Some(open)
            }
            (Some(open), _) if open.dialled => {
                open.set_inbound_transport(None);
                Some(open)
            }
            (Some(open), _) => {
                debug!(session_id = %open.id, "no return route requested; closing session");
                self.sessions.remove(&open.id);
                if let Err(err) = open.close().await {
                    debug!(session_id = %open.id, error = %err, "session close failed");
                }
                None
            }
            (None, _) => None,
        };

        let ctx = InboundMessageContext {
            message,
            sender_key: decrypted.sender_key,
            recipient_key: Some(decrypted.recipient_key),
            connection,
            session_id: session.map(|s| s.id.clone()),
            received_at: chrono::Utc::now(),
        };
        self.dispatch(ctx).await
    }

    /// Run the handler for an already decrypted message.
    pub async fn dispatch(&self, ctx: InboundMessageContext) -> Result<(), AgentError> {
        if ctx.message.is::<ProblemReport>() {
            match ctx.message.body::<ProblemReport>() {
                Ok(report) => warn!(
                    code = %report.description.code,
                    description = %report.description.en,
                    thread_id = %ctx.message.thread_id(),
                    "problem report received"
                ),
                Err(err) => warn!(error = %err, "unreadable problem report received"),
            }
            return Ok(());
        }

        let handler = match ctx.message.parsed_type() {
            Ok(message_type) => self.handlers.find(&message_type),
            Err(err) => {
                return self
                    .answer_problem(&ctx, codes::MESSAGE_PARSE_FAILURE, &err.to_string(), None)
                    .await
            }
        };
        let Some(handler) = handler else {
            info!(message_type = %ctx.message.message_type, "no handler registered");
            let description = format!("Message type {} is not supported", ctx.message.message_type);
            return self
                .answer_problem(&ctx, codes::UNSUPPORTED_MESSAGE_TYPE, &description, None)
                .await;
        };

        match handler.handle(&ctx).await {
            Ok(Some(response)) => {
                self.dispatcher.send_message(response, None).await?;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(AgentError::ProblemReport {
                code,
                description,
                protocol,
            }) => {
                self.answer_problem(&ctx, &code, &description, protocol.as_deref())
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn answer_problem(
        &self,
        ctx: &InboundMessageContext,
        code: &str,
        description: &str,
        protocol: Option<&str>,
    ) -> Result<(), AgentError> {
        let Some(report) = problem_report_for(&ctx.message, code, description, protocol)? else {
            return Ok(());
        };
        if ctx.connection.is_none() && ctx.session_id.is_none() {
            warn!(code, description, "cannot answer problem: no connection or session");
            return Ok(());
        }
        debug!(code, message_id = %ctx.message.id, "sending problem report");
        self.dispatcher.send_message(ctx.reply_with(report), None).await?;
        Ok(())
    }

    /// Drain the bus's inbound lane into [`MessageReceiver::receive`] until
    /// shutdown. The next envelope is taken only once a permit is free, so
    /// a busy receiver leaves the backlog in the lane and producers wait.
    pub fn spawn_listener(self: Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        let Some(mut inbound) = self.events.take_inbound() else {
            error!("inbound lane already has a listener");
            return tokio::spawn(async {});
        };
        tokio::spawn(async move {
            let stop = shutdown.wait();
            tokio::pin!(stop);
            loop {
                let permit = tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    permit = Arc::clone(&self.gate).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let next = tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    next = inbound.recv() => next,
                };
                let Some(InboundEnvelope {
                    envelope,
                    session_id,
                    connection_id,
                }) = next
                else {
                    break;
                };

                let receiver = Arc::clone(&self);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = receiver
                        .receive(&envelope, session_id.as_deref(), connection_id.as_deref())
                        .await
                    {
                        warn!(error = %err, "inbound message dropped");
                    }
                });
            }
            debug!("receiver listener stopped");
        })
    }
}
