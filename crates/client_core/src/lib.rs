pub mod api;
pub mod composer;
pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod kv;
mod runtime;
pub mod session;
pub mod synchronizer;
pub mod transport;

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use shared::{
    domain::{Channel, ChatMessage, Session},
    protocol::Credentials,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

pub use api::{ChatApi, HttpChatApi, OutgoingAttachment};
pub use config::{load_config, ClientConfig};
pub use connection::{ConnectionId, ConnectionState};
pub use error::{ClientError, Notice, NoticeKind};
pub use kv::{KeyValueStore, MemoryStore};
pub use synchronizer::SyncState;
pub use transport::{TransportConnector, TransportHandle, TransportPeer, WebSocketConnector};

use crate::{runtime::Runtime, session::SessionStore};

pub const SIGN_UP_SUCCESS: &str = "Signup successful! Please login now.";

/// Discrete things that happened inside the core, in processing order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionChanged { identity: Option<String> },
    ConnectionChanged(ConnectionState),
    ChannelsLoaded(Vec<Channel>),
    ActiveChannelChanged { channel: String },
    /// The active channel's buffer was replaced by a history delivery.
    HistoryLoaded {
        channel: String,
        messages: Vec<ChatMessage>,
    },
    MessageAppended(ChatMessage),
    /// The server ended the session; carries its reason verbatim.
    ForcedLogout { reason: String },
    Notice(Notice),
}

/// Snapshot of everything a front end renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    pub identity: Option<String>,
    pub connection: ConnectionState,
    pub channels: Vec<Channel>,
    pub active_channel: String,
    pub sync_state: SyncState,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub default_channel: String,
    pub reconnect_delay: Option<Duration>,
}

impl From<&ClientConfig> for ClientSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            default_channel: config.default_channel.clone(),
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

pub(crate) enum Command {
    SignIn {
        credentials: Credentials,
        reply: oneshot::Sender<Result<Session, ClientError>>,
    },
    SignUp {
        credentials: Credentials,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    SignOut {
        reply: oneshot::Sender<()>,
    },
    SelectChannel {
        channel: String,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Compose {
        text: String,
        attachment: Option<OutgoingAttachment>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    ReloadChannels {
        reply: oneshot::Sender<Result<Vec<Channel>, ClientError>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap, cloneable handle to the core runtime task.
#[derive(Clone)]
pub struct ChatClient {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ClientEvent>,
    view: watch::Receiver<ClientView>,
    session: watch::Receiver<Option<Session>>,
}

impl ChatClient {
    /// Starts the runtime on the current tokio runtime. Any persisted session
    /// is restored and the channel directory is loaded once.
    pub fn spawn(
        settings: ClientSettings,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn TransportConnector>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);
        let session = SessionStore::new(store);
        let session_rx = session.subscribe();
        let runtime = Runtime::new(
            settings,
            api,
            connector,
            session,
            commands_rx,
            events.clone(),
        );
        let view = runtime.view_receiver();
        tokio::spawn(runtime.run());
        Self {
            commands: commands_tx,
            events,
            view,
            session: session_rx,
        }
    }

    /// Wires the HTTP services and WebSocket transport described by `config`.
    pub fn from_config(config: &ClientConfig, store: Arc<dyn KeyValueStore>) -> anyhow::Result<Self> {
        let server_url = config.server_url()?;
        let api = HttpChatApi::new(server_url.clone(), config.request_timeout())
            .context("failed to build http client")?;
        let connector = WebSocketConnector::for_server(&server_url)
            .context("failed to derive websocket url")?;
        Ok(Self::spawn(
            ClientSettings::from(config),
            Arc::new(api),
            Arc::new(connector),
            store,
        ))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn view(&self) -> ClientView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<ClientView> {
        self.view.clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.session.borrow().clone()
    }

    pub async fn sign_in(&self, username: &str, password: &str) -> Result<Session, ClientError> {
        let credentials = credentials(username, password)?;
        self.request(|reply| Command::SignIn { credentials, reply })
            .await?
    }

    pub async fn sign_up(&self, username: &str, password: &str) -> Result<(), ClientError> {
        let credentials = credentials(username, password)?;
        self.request(|reply| Command::SignUp { credentials, reply })
            .await?
    }

    /// Idempotent.
    pub async fn sign_out(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::SignOut { reply }).await
    }

    pub async fn select_channel(&self, channel: &str) -> Result<(), ClientError> {
        let channel = channel.trim().to_string();
        self.request(|reply| Command::SelectChannel { channel, reply })
            .await?
    }

    /// Sends `text` (and `attachment`, uploaded first) to the active channel.
    /// Resolves once the send event has been handed to the transport.
    pub async fn compose(
        &self,
        text: impl Into<String>,
        attachment: Option<OutgoingAttachment>,
    ) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| Command::Compose {
            text,
            attachment,
            reply,
        })
        .await?
    }

    pub async fn reload_channels(&self) -> Result<Vec<Channel>, ClientError> {
        self.request(|reply| Command::ReloadChannels { reply })
            .await?
    }

    /// Replaces the transport with a fresh connection for the current session.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Reconnect { reply }).await?
    }

    /// Stops the runtime and closes the transport. Later calls fail with
    /// [`ClientError::Shutdown`].
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| Command::Shutdown { reply }).await;
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ClientError::Shutdown)?;
        response.await.map_err(|_| ClientError::Shutdown)
    }
}

/// Usernames are trimmed. Passwords are checked trimmed but sent as typed.
fn credentials(username: &str, password: &str) -> Result<Credentials, ClientError> {
    let username = username.trim();
    if username.is_empty() || password.trim().is_empty() {
        return Err(ClientError::Validation("Enter username and password".into()));
    }
    Ok(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
