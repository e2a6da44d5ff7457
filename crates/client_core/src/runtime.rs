//! The task that owns all core state.
//!
//! Inputs are handled strictly one at a time: user commands, inbound events
//! from the live transport, and completions of network calls that were
//! spawned off the loop. A handler never awaits the network itself, so a
//! discard-then-join sequence can never interleave with an inbound event.

use std::{sync::Arc, time::Duration};

use shared::{
    domain::{Channel, Session},
    protocol::{Credentials, UploadResponse},
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    composer::{self, Draft},
    connection::{ConnectionId, ConnectionManager, ConnectionState, OutboundSink},
    directory::ChannelDirectory,
    error::{ClientError, Notice},
    session::SessionStore,
    synchronizer::ConversationSynchronizer,
    transport::{TransportConnector, TransportError, TransportEvent, TransportHandle},
    ClientEvent, ClientSettings, ClientView, Command, SIGN_UP_SUCCESS,
};

/// Outcomes of work spawned off the loop.
enum Completion {
    SignedIn {
        result: Result<Session, ClientError>,
        reply: oneshot::Sender<Result<Session, ClientError>>,
    },
    SignedUp {
        result: Result<(), ClientError>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    ChannelsLoaded {
        result: Result<Vec<Channel>, ClientError>,
        reply: Option<oneshot::Sender<Result<Vec<Channel>, ClientError>>>,
    },
    Handshake {
        id: ConnectionId,
        result: Result<TransportHandle, TransportError>,
    },
    Uploaded {
        epoch: u64,
        channel: String,
        text: String,
        result: Result<UploadResponse, ClientError>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    ReconnectDue {
        epoch: u64,
    },
}

pub(crate) struct Runtime {
    api: Arc<dyn ChatApi>,
    connector: Arc<dyn TransportConnector>,
    session: SessionStore,
    /// Bumped on every session change; completions from an older epoch
    /// belong to a session that no longer exists.
    session_epoch: u64,
    connection: ConnectionManager,
    directory: ChannelDirectory,
    sync: ConversationSynchronizer,
    default_channel: String,
    reconnect_delay: Option<Duration>,
    commands: mpsc::UnboundedReceiver<Command>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    events: broadcast::Sender<ClientEvent>,
    view: watch::Sender<ClientView>,
}

impl Runtime {
    pub(crate) fn new(
        settings: ClientSettings,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn TransportConnector>,
        session: SessionStore,
        commands: mpsc::UnboundedReceiver<Command>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let sync = ConversationSynchronizer::new(settings.default_channel.clone());
        let connection = ConnectionManager::new();
        let directory = ChannelDirectory::new();
        let (view, _) = watch::channel(ClientView {
            identity: None,
            connection: connection.state(),
            channels: Vec::new(),
            active_channel: sync.active_channel().to_string(),
            sync_state: sync.state(),
            messages: Vec::new(),
        });
        Self {
            api,
            connector,
            session,
            session_epoch: 0,
            connection,
            directory,
            sync,
            default_channel: settings.default_channel,
            reconnect_delay: settings.reconnect_delay,
            commands,
            completions_tx,
            completions,
            events,
            view,
        }
    }

    pub(crate) fn view_receiver(&self) -> watch::Receiver<ClientView> {
        self.view.subscribe()
    }

    pub(crate) async fn run(mut self) {
        self.startup().await;
        self.publish_view();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.connection.teardown();
                        self.publish_view();
                        info!("runtime: shut down");
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(completion) = self.completions.recv() => {
                    self.handle_completion(completion).await;
                }
                (id, event) = self.connection.next_event() => {
                    self.handle_transport_event(id, event).await;
                }
            }
            self.publish_view();
        }

        self.connection.teardown();
        info!("runtime: all client handles dropped");
    }

    async fn startup(&mut self) {
        if let Some(session) = self.session.restore().await {
            info!(identity = session.identity(), "runtime: resuming persisted session");
            self.session_epoch += 1;
            self.emit(ClientEvent::SessionChanged {
                identity: Some(session.identity().to_string()),
            });
            self.start_connect(&session);
        }
        self.spawn_directory_load(None);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SignIn { credentials, reply } => self.spawn_sign_in(credentials, reply),
            Command::SignUp { credentials, reply } => self.spawn_sign_up(credentials, reply),
            Command::SignOut { reply } => {
                self.end_session().await;
                let _ = reply.send(());
            }
            Command::SelectChannel { channel, reply } => {
                let _ = reply.send(self.select_channel(channel));
            }
            Command::Compose {
                text,
                attachment,
                reply,
            } => self.compose(text, attachment, reply),
            Command::ReloadChannels { reply } => self.spawn_directory_load(Some(reply)),
            Command::Reconnect { reply } => {
                let result = match self.session.current() {
                    Some(session) => {
                        self.start_connect(&session);
                        Ok(())
                    }
                    None => Err(ClientError::NotAuthenticated),
                };
                let _ = reply.send(result);
            }
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::SignedIn { result, reply } => {
                if let Ok(session) = &result {
                    self.adopt_session(session.clone()).await;
                }
                let _ = reply.send(result);
            }
            Completion::SignedUp { result, reply } => {
                if result.is_ok() {
                    self.emit(ClientEvent::Notice(Notice::info(SIGN_UP_SUCCESS)));
                }
                let _ = reply.send(result);
            }
            Completion::ChannelsLoaded { result, reply } => match result {
                Ok(channels) => {
                    info!(count = channels.len(), "directory: loaded");
                    self.directory.replace(channels.clone());
                    self.emit(ClientEvent::ChannelsLoaded(channels.clone()));
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(channels));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "directory: load failed");
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(Err(err));
                        }
                        None => self.emit(ClientEvent::Notice(Notice::from(&err))),
                    }
                }
            },
            Completion::Handshake { id, result } => self.finish_handshake(id, result),
            Completion::Uploaded {
                epoch,
                channel,
                text,
                result,
                reply,
            } => {
                let outcome = match result {
                    Err(err) => {
                        warn!(error = %err, "composer: upload failed, message not sent");
                        Err(err)
                    }
                    Ok(_) if epoch != self.session_epoch => {
                        debug!("composer: session changed during upload, message dropped");
                        Err(ClientError::NotAuthenticated)
                    }
                    Ok(stored) => self
                        .connection
                        .emit(composer::send_request(&channel, text, Some(stored)))
                        .map_err(ClientError::from),
                };
                let _ = reply.send(outcome);
            }
            Completion::ReconnectDue { epoch } => {
                if epoch != self.session_epoch
                    || self.connection.state() != ConnectionState::Disconnected
                {
                    debug!("connection: scheduled reconnect no longer needed");
                    return;
                }
                if let Some(session) = self.session.current() {
                    info!("connection: reconnecting");
                    self.start_connect(&session);
                }
            }
        }
    }

    async fn handle_transport_event(&mut self, id: ConnectionId, event: TransportEvent) {
        if !self.connection.accepts(id) {
            debug!(connection = id.0, "runtime: event from stale connection dropped");
            return;
        }
        match event {
            TransportEvent::History { channel, messages } => {
                if let Some(count) = self.sync.on_history(channel.as_deref(), messages) {
                    debug!(channel = %self.sync.active_channel(), count, "sync: history applied");
                    self.emit(ClientEvent::HistoryLoaded {
                        channel: self.sync.active_channel().to_string(),
                        messages: self.sync.buffer().to_vec(),
                    });
                }
            }
            TransportEvent::Message(message) => {
                if self.sync.on_message(message.clone()) {
                    self.emit(ClientEvent::MessageAppended(message));
                }
            }
            TransportEvent::ForceLogout { reason } => {
                warn!(%reason, "runtime: session terminated by server");
                self.emit(ClientEvent::ForcedLogout { reason });
                self.end_session().await;
            }
            TransportEvent::Disconnected { reason } => {
                if !self.connection.remote_disconnected(id) {
                    return;
                }
                self.emit(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
                let message = match reason {
                    Some(reason) => format!("connection lost: {reason}"),
                    None => "connection lost".to_string(),
                };
                self.emit(ClientEvent::Notice(Notice::from(&ClientError::Network(message))));
                self.schedule_reconnect();
            }
        }
    }

    fn select_channel(&mut self, channel: String) -> Result<(), ClientError> {
        if channel.is_empty() {
            return Err(ClientError::Validation("Choose a channel".into()));
        }
        if channel == self.sync.active_channel() {
            return Ok(());
        }
        if !self.directory.contains(&channel) && channel != self.default_channel {
            return Err(ClientError::Validation(format!("Unknown channel '{channel}'")));
        }
        self.sync.select_channel(&channel, &mut self.connection);
        self.emit(ClientEvent::ActiveChannelChanged { channel });
        Ok(())
    }

    fn compose(
        &mut self,
        text: String,
        attachment: Option<crate::api::OutgoingAttachment>,
        reply: oneshot::Sender<Result<(), ClientError>>,
    ) {
        if !self.session.is_authenticated() {
            let _ = reply.send(Err(ClientError::NotAuthenticated));
            return;
        }
        let mut draft = match Draft::new(text, attachment) {
            Ok(draft) => draft,
            Err(err) => {
                let _ = reply.send(Err(err));
                return;
            }
        };
        if !self.connection.is_connected() {
            let _ = reply.send(Err(ClientError::NotConnected));
            return;
        }

        let channel = self.sync.active_channel().to_string();
        match draft.take_attachment() {
            None => {
                let result = self
                    .connection
                    .emit(composer::send_request(&channel, draft.text, None))
                    .map_err(ClientError::from);
                let _ = reply.send(result);
            }
            Some(attachment) => {
                let api = Arc::clone(&self.api);
                let completions = self.completions_tx.clone();
                let epoch = self.session_epoch;
                let text = draft.text;
                tokio::spawn(async move {
                    let result = api.upload(attachment).await;
                    let _ = completions.send(Completion::Uploaded {
                        epoch,
                        channel,
                        text,
                        result,
                        reply,
                    });
                });
            }
        }
    }

    /// Installs a freshly authenticated session and rebinds the transport
    /// to its token.
    async fn adopt_session(&mut self, session: Session) {
        let changed = self.session.authenticate(session.clone()).await;
        if !changed && self.connection.state() != ConnectionState::Disconnected {
            debug!("runtime: same token re-authenticated, keeping transport");
            return;
        }
        self.session_epoch += 1;
        self.emit(ClientEvent::SessionChanged {
            identity: Some(session.identity().to_string()),
        });
        self.sync.reset();
        self.start_connect(&session);
    }

    /// Shared by user logout and forced termination. Safe to call twice.
    async fn end_session(&mut self) {
        let cleared = self.session.clear().await;
        self.session_epoch += 1;
        if self.connection.teardown() {
            self.emit(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
        }
        self.sync.reset();
        if cleared {
            info!("runtime: session ended");
            self.emit(ClientEvent::SessionChanged { identity: None });
        }
    }

    fn start_connect(&mut self, session: &Session) {
        let id = self.connection.begin_connect();
        self.emit(ClientEvent::ConnectionChanged(ConnectionState::Connecting));
        let connector = Arc::clone(&self.connector);
        let completions = self.completions_tx.clone();
        let token = session.token().to_string();
        tokio::spawn(async move {
            let result = connector.connect(&token).await;
            let _ = completions.send(Completion::Handshake { id, result });
        });
    }

    fn finish_handshake(&mut self, id: ConnectionId, result: Result<TransportHandle, TransportError>) {
        match result {
            Ok(handle) => {
                if self.connection.install(id, handle).is_err() {
                    // Superseded attempt; the returned handle is dropped here.
                    return;
                }
                self.emit(ClientEvent::ConnectionChanged(ConnectionState::Connected));
                self.sync.on_transport_ready(&mut self.connection);
            }
            Err(err) => {
                if !self.connection.connect_failed(id) {
                    debug!(connection = id.0, error = %err, "connection: stale handshake failure ignored");
                    return;
                }
                warn!(connection = id.0, error = %err, "connection: handshake failed");
                self.emit(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
                self.emit(ClientEvent::Notice(Notice::from(&ClientError::from(err))));
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        let Some(delay) = self.reconnect_delay else {
            return;
        };
        if !self.session.is_authenticated() {
            return;
        }
        let epoch = self.session_epoch;
        let completions = self.completions_tx.clone();
        debug!(delay_ms = delay.as_millis() as u64, "connection: reconnect scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = completions.send(Completion::ReconnectDue { epoch });
        });
    }

    fn spawn_sign_in(
        &mut self,
        credentials: Credentials,
        reply: oneshot::Sender<Result<Session, ClientError>>,
    ) {
        let api = Arc::clone(&self.api);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.sign_in(&credentials).await;
            let _ = completions.send(Completion::SignedIn { result, reply });
        });
    }

    fn spawn_sign_up(
        &mut self,
        credentials: Credentials,
        reply: oneshot::Sender<Result<(), ClientError>>,
    ) {
        let api = Arc::clone(&self.api);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.sign_up(&credentials).await;
            let _ = completions.send(Completion::SignedUp { result, reply });
        });
    }

    fn spawn_directory_load(
        &mut self,
        reply: Option<oneshot::Sender<Result<Vec<Channel>, ClientError>>>,
    ) {
        let api = Arc::clone(&self.api);
        let completions = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = api.list_channels().await;
            let _ = completions.send(Completion::ChannelsLoaded { result, reply });
        });
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn publish_view(&self) {
        let identity = self
            .session
            .current()
            .map(|session| session.identity().to_string());
        let connection = self.connection.state();
        let sync_state = self.sync.state();
        self.view.send_if_modified(|view| {
            let next = ClientView {
                identity,
                connection,
                channels: self.directory.channels().to_vec(),
                active_channel: self.sync.active_channel().to_string(),
                sync_state,
                messages: self.sync.buffer().to_vec(),
            };
            if *view == next {
                return false;
            }
            *view = next;
            true
        });
    }
}
