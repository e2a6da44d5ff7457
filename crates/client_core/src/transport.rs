//! Bidirectional event transport.
//!
//! Inbound frames are decoded and validated here, at the boundary: the rest
//! of the core only ever sees well-formed [`TransportEvent`]s. A malformed
//! frame is logged and dropped without affecting the connection.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::{
    domain::ChatMessage,
    error::MessageError,
    protocol::{ClientRequest, MessagePayload, ServerEvent},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Error as WsError, Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    History {
        /// Channel the history answers, when the server tags it.
        channel: Option<String>,
        messages: Vec<ChatMessage>,
    },
    Message(ChatMessage),
    ForceLogout {
        reason: String,
    },
    Disconnected {
        reason: Option<String>,
    },
}

impl TransportEvent {
    pub fn from_server_event(event: ServerEvent) -> Result<Self, MessageError> {
        match event {
            ServerEvent::ChannelHistory(payload) => {
                let (channel, raw_messages) = payload.into_parts();
                let messages = raw_messages
                    .into_iter()
                    .filter_map(parse_history_entry)
                    .collect();
                Ok(TransportEvent::History { channel, messages })
            }
            ServerEvent::ReceiveMessage(payload) => {
                ChatMessage::try_from(payload).map(TransportEvent::Message)
            }
            ServerEvent::ForceLogout(reason) => Ok(TransportEvent::ForceLogout { reason }),
        }
    }
}

fn parse_history_entry(raw: Value) -> Option<ChatMessage> {
    let payload = match serde_json::from_value::<MessagePayload>(raw) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "transport: dropping undecodable history entry");
            return None;
        }
    };
    match ChatMessage::try_from(payload) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, "transport: dropping invalid history entry");
            None
        }
    }
}

/// Decodes and validates one text frame; `None` when it has to be dropped.
pub fn decode_frame(text: &str) -> Option<TransportEvent> {
    let event = match ServerEvent::from_frame(text) {
        Ok(event) => event,
        Err(err) => {
            warn!(error = %err, "transport: dropping malformed frame");
            return None;
        }
    };
    let name = event.name();
    match TransportEvent::from_server_event(event) {
        Ok(event) => Some(event),
        Err(err) => {
            warn!(event = name, error = %err, "transport: dropping invalid event payload");
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("invalid transport url: {0}")]
    InvalidUrl(String),
    #[error("token cannot be sent as a header")]
    InvalidToken,
    #[error("transport handshake rejected with status {status}")]
    Handshake { status: u16 },
    #[error("failed to connect transport: {0}")]
    Connect(String),
    #[error("transport is closed")]
    Closed,
}

impl From<TransportError> for ClientError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => ClientError::NotConnected,
            other => ClientError::Network(other.to_string()),
        }
    }
}

/// One live transport connection: an outbound request queue and the stream
/// of validated inbound events. Dropping the handle closes the connection.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: UnboundedSender<ClientRequest>,
    inbound: UnboundedReceiver<TransportEvent>,
}

impl TransportHandle {
    pub fn new(
        outbound: UnboundedSender<ClientRequest>,
        inbound: UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// A handle wired to a [`TransportPeer`] instead of a socket.
    pub fn in_memory() -> (Self, TransportPeer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self::new(outbound_tx, inbound_rx),
            TransportPeer {
                events: inbound_tx,
                requests: outbound_rx,
            },
        )
    }

    /// Queues a request; fire-and-forget, never waits on the network.
    pub fn emit(&self, request: ClientRequest) -> Result<(), TransportError> {
        self.outbound
            .send(request)
            .map_err(|_| TransportError::Closed)
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
}

/// The remote end of an in-memory [`TransportHandle`].
#[derive(Debug)]
pub struct TransportPeer {
    events: UnboundedSender<TransportEvent>,
    requests: UnboundedReceiver<ClientRequest>,
}

impl TransportPeer {
    /// Delivers an event; `false` once the client side is gone.
    pub fn push(&self, event: TransportEvent) -> bool {
        self.events.send(event).is_ok()
    }

    /// Decodes a raw frame exactly like the socket transport would.
    pub fn push_frame(&self, text: &str) -> bool {
        match decode_frame(text) {
            Some(event) => self.push(event),
            None => !self.events.is_closed(),
        }
    }

    pub async fn next_request(&mut self) -> Option<ClientRequest> {
        self.requests.recv().await
    }

    pub fn try_next_request(&mut self) -> Option<ClientRequest> {
        self.requests.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    pub fn disconnect(self, reason: Option<String>) {
        let _ = self.events.send(TransportEvent::Disconnected { reason });
    }
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<TransportHandle, TransportError>;
}

pub struct WebSocketConnector {
    ws_url: Url,
}

impl WebSocketConnector {
    pub fn new(ws_url: Url) -> Self {
        Self { ws_url }
    }

    /// Derives the socket endpoint (`/ws`) from the HTTP server url.
    pub fn for_server(server_url: &Url) -> Result<Self, TransportError> {
        Ok(Self::new(websocket_url(server_url)?))
    }
}

pub fn websocket_url(server_url: &Url) -> Result<Url, TransportError> {
    let scheme = match server_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    let mut ws_url = server_url
        .join("ws")
        .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
    ws_url
        .set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(format!("cannot use scheme '{scheme}'")))?;
    Ok(ws_url)
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn connect(&self, token: &str) -> Result<TransportHandle, TransportError> {
        let mut request = self
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| TransportError::InvalidToken)?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request).await.map_err(|err| match err {
            WsError::Http(response) => TransportError::Handshake {
                status: response.status().as_u16(),
            },
            other => TransportError::Connect(other.to_string()),
        })?;
        info!(url = %self.ws_url, "transport: connected");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_socket(stream, outbound_rx, inbound_tx));
        Ok(TransportHandle::new(outbound_tx, inbound_rx))
    }
}

async fn pump_socket(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: UnboundedReceiver<ClientRequest>,
    inbound: UnboundedSender<TransportEvent>,
) {
    let (mut writer, mut reader) = stream.split();
    let reason = loop {
        tokio::select! {
            request = outbound.recv() => {
                let Some(request) = request else {
                    // Handle dropped locally: close quietly, nobody is listening.
                    let _ = writer.send(Message::Close(None)).await;
                    debug!("transport: closed by client");
                    return;
                };
                let frame = match serde_json::to_string(&request) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(event = request.name(), error = %err, "transport: failed to encode request");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(frame)).await {
                    break Some(format!("send failed: {err}"));
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = decode_frame(&text) {
                        if inbound.send(event).is_err() {
                            let _ = writer.send(Message::Close(None)).await;
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    break frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Some(err.to_string()),
                None => break None,
            }
        }
    };
    info!(reason = reason.as_deref().unwrap_or("none"), "transport: remote disconnected");
    let _ = inbound.send(TransportEvent::Disconnected { reason });
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
