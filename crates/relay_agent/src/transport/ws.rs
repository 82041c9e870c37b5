//! WebSocket outbound transport.
//!
//! One socket per endpoint, reused across sends. Each socket is registered
//! as a [`TransportSession`] so replies and live delivery can travel back
//! over it, and a reader task feeds inbound frames to the receiver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use relay_proto::EncryptedMessage;
use tokio::{net::TcpStream, sync::Mutex, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{OutboundPackage, OutboundTransport, SessionChannel, TransportSession, TransportSessionRegistry};
use crate::{
    error::AgentError,
    events::{AgentEvent, EventBus, InboundEnvelope},
};

pub const SESSION_KIND: &str = "WebSocket";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsChannel {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl SessionChannel for WsChannel {
    async fn send(&self, envelope: &EncryptedMessage) -> Result<(), AgentError> {
        let bytes = envelope.to_bytes()?;
        self.sink.lock().await.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.sink.lock().await.close().await?;
        Ok(())
    }
}

#[derive(Default)]
struct Sockets {
    by_endpoint: HashMap<String, Arc<TransportSession>>,
    readers: Vec<JoinHandle<()>>,
}

pub struct WsOutboundTransport {
    events: EventBus,
    sessions: Arc<TransportSessionRegistry>,
    sockets: Arc<Mutex<Sockets>>,
}

impl WsOutboundTransport {
    pub fn new(events: EventBus, sessions: Arc<TransportSessionRegistry>) -> Self {
        Self {
            events,
            sessions,
            sockets: Arc::new(Mutex::new(Sockets::default())),
        }
    }

    /// The open socket for the endpoint, dialling one if needed. The map is
    /// not locked while dialling; when two sends race, the first socket
    /// registered wins and the other is closed.
    async fn socket_for(&self, package: &OutboundPackage) -> Result<Arc<TransportSession>, AgentError> {
        if let Some(existing) = self.sockets.lock().await.by_endpoint.get(&package.endpoint) {
            return Ok(Arc::clone(existing));
        }

        let (stream, _response) = connect_async(package.endpoint.as_str())
            .await
            .map_err(|e| AgentError::Delivery {
                endpoint: package.endpoint.clone(),
                reason: e.to_string(),
            })?;
        let (sink, stream) = stream.split();
        let session = TransportSession::dialled(SESSION_KIND, Arc::new(WsChannel { sink: Mutex::new(sink) }));
        if let Some(connection_id) = &package.connection_id {
            session.set_connection_id(connection_id.clone());
        }

        let mut sockets = self.sockets.lock().await;
        if let Some(winner) = sockets.by_endpoint.get(&package.endpoint).cloned() {
            drop(sockets);
            debug!(endpoint = %package.endpoint, "concurrent dial lost; closing duplicate socket");
            if let Err(err) = session.close().await {
                debug!(endpoint = %package.endpoint, error = %err, "duplicate websocket close failed");
            }
            return Ok(winner);
        }
        info!(endpoint = %package.endpoint, session_id = %session.id, "websocket opened");
        sockets.by_endpoint.insert(package.endpoint.clone(), Arc::clone(&session));
        sockets.readers.retain(|h| !h.is_finished());
        sockets.readers.push(tokio::spawn(read_loop(
            stream,
            package.endpoint.clone(),
            Arc::clone(&session),
            self.events.clone(),
            Arc::clone(&self.sessions),
            Arc::clone(&self.sockets),
        )));
        drop(sockets);

        self.sessions.save(Arc::clone(&session)).await;
        self.events.emit(AgentEvent::OutboundSessionOpened {
            endpoint: package.endpoint.clone(),
            connection_id: package.connection_id.clone(),
        });
        Ok(session)
    }

    /// Forget the socket for `endpoint` if it is still `session`.
    async fn discard(&self, endpoint: &str, session: &TransportSession) {
        forget_socket(&self.sockets, endpoint, &session.id).await;
        self.sessions.remove(&session.id);
    }
}

#[async_trait]
impl OutboundTransport for WsOutboundTransport {
    fn supported_schemes(&self) -> &[&'static str] {
        &["ws", "wss"]
    }

    async fn start(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), AgentError> {
        let mut sockets = self.sockets.lock().await;
        for (endpoint, session) in sockets.by_endpoint.drain() {
            if let Err(err) = session.close().await {
                debug!(endpoint = %endpoint, error = %err, "websocket close failed");
            }
            self.sessions.remove(&session.id);
        }
        for reader in sockets.readers.drain(..) {
            reader.abort();
        }
        Ok(())
    }

    async fn send_message(&self, package: OutboundPackage) -> Result<(), AgentError> {
        let session = self.socket_for(&package).await?;
        if let Err(err) = session.send(&package.payload).await {
            self.discard(&package.endpoint, &session).await;
            return Err(AgentError::Delivery {
                endpoint: package.endpoint,
                reason: err.to_string(),
            });
        }
        debug!(endpoint = %package.endpoint, session_id = %session.id, "websocket send");
        Ok(())
    }
}

async fn forget_socket(sockets: &Mutex<Sockets>, endpoint: &str, session_id: &str) {
    let mut sockets = sockets.lock().await;
    if sockets.by_endpoint.get(endpoint).map(|s| s.id.as_str()) == Some(session_id) {
        sockets.by_endpoint.remove(endpoint);
    }
}

async fn read_loop(
    mut stream: futures_util::stream::SplitStream<WsStream>,
    endpoint: String,
    session: Arc<TransportSession>,
    events: EventBus,
    sessions: Arc<TransportSessionRegistry>,
    sockets: Arc<Mutex<Sockets>>,
) {
    while let Some(frame) = stream.next().await {
        let bytes = match frame {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "websocket read failed");
                break;
            }
        };
        let envelope = match EncryptedMessage::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(endpoint = %endpoint, error = %err, "dropping non-envelope frame");
                continue;
            }
        };
        // Waits while the receiver is backed up; the socket is not read
        // meanwhile.
        let inbound = InboundEnvelope {
            envelope,
            session_id: Some(session.id.clone()),
            connection_id: session.connection_id(),
        };
        if let Err(err) = events.deliver_inbound(inbound).await {
            warn!(endpoint = %endpoint, error = %err, "receive pipeline gone; closing websocket");
            break;
        }
    }

    info!(endpoint = %endpoint, session_id = %session.id, "websocket closed");
    forget_socket(&sockets, &endpoint, &session.id).await;
    sessions.remove(&session.id);
    events.emit(AgentEvent::OutboundSessionClosed {
        endpoint,
        connection_id: session.connection_id(),
    });
}
