use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::json;
use shared::protocol::{ClientRequest, SendMessagePayload, UploadResponse};
use tokio::{
    sync::{mpsc, Notify},
    time::timeout,
};

use super::*;
use crate::{
    session::{IDENTITY_KEY, TOKEN_KEY},
    transport::TransportError,
};

const WAIT: Duration = Duration::from_secs(5);

struct FakeApi {
    channels: StdMutex<Result<Vec<Channel>, ClientError>>,
    upload: StdMutex<Result<UploadResponse, ClientError>>,
    upload_gate: Option<Arc<Notify>>,
    sign_in_calls: AtomicUsize,
    upload_calls: AtomicUsize,
}

impl FakeApi {
    fn new() -> Self {
        Self {
            channels: StdMutex::new(Ok(vec![Channel::new("general"), Channel::new("random")])),
            upload: StdMutex::new(Ok(UploadResponse {
                url: "/uploads/7-cat.png".into(),
                original_name: "cat.png".into(),
            })),
            upload_gate: None,
            sign_in_calls: AtomicUsize::new(0),
            upload_calls: AtomicUsize::new(0),
        }
    }

    fn set_channels(&self, result: Result<Vec<Channel>, ClientError>) {
        *self.channels.lock().expect("lock") = result;
    }

    fn set_upload(&self, result: Result<UploadResponse, ClientError>) {
        *self.upload.lock().expect("lock") = result;
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ClientError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        if credentials.password == "wrong" {
            return Err(ClientError::Rejected("Invalid credentials".into()));
        }
        Ok(Session::new(
            credentials.username.clone(),
            format!("token-{}", credentials.username),
        )
        .expect("session"))
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<(), ClientError> {
        if credentials.username == "taken" {
            return Err(ClientError::Rejected("Username already exists".into()));
        }
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, ClientError> {
        self.channels.lock().expect("lock").clone()
    }

    async fn upload(&self, _attachment: OutgoingAttachment) -> Result<UploadResponse, ClientError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.upload_gate {
            gate.notified().await;
        }
        self.upload.lock().expect("lock").clone()
    }
}

/// Hands every connection's remote end to the test.
struct FakeConnector {
    peers: mpsc::UnboundedSender<(String, TransportPeer)>,
    refuse: AtomicBool,
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, token: &str) -> Result<TransportHandle, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Handshake { status: 401 });
        }
        let (handle, peer) = TransportHandle::in_memory();
        let _ = self.peers.send((token.to_string(), peer));
        Ok(handle)
    }
}

struct Harness {
    client: ChatClient,
    api: Arc<FakeApi>,
    connector: Arc<FakeConnector>,
    store: Arc<MemoryStore>,
    peers: mpsc::UnboundedReceiver<(String, TransportPeer)>,
}

impl Harness {
    async fn start(api: FakeApi) -> Self {
        Self::start_with(api, MemoryStore::new(), Some(Duration::from_millis(10))).await
    }

    async fn start_with(
        api: FakeApi,
        store: MemoryStore,
        reconnect_delay: Option<Duration>,
    ) -> Self {
        let api = Arc::new(api);
        let store = Arc::new(store);
        let (peers_tx, peers) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeConnector {
            peers: peers_tx,
            refuse: AtomicBool::new(false),
        });
        let client = ChatClient::spawn(
            ClientSettings {
                default_channel: "general".into(),
                reconnect_delay,
            },
            api.clone(),
            connector.clone(),
            store.clone(),
        );
        Self {
            client,
            api,
            connector,
            store,
            peers,
        }
    }

    async fn next_peer(&mut self) -> (String, TransportPeer) {
        timeout(WAIT, self.peers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    async fn wait_view(&self, predicate: impl Fn(&ClientView) -> bool) -> ClientView {
        let mut view = self.client.watch_view();
        let current = timeout(WAIT, view.wait_for(|current| predicate(current)))
            .await
            .expect("timed out waiting for view")
            .expect("runtime stopped")
            .clone();
        current
    }

    /// Signs in and waits until the transport is live and the default
    /// channel has been joined.
    async fn connected(&mut self, username: &str) -> TransportPeer {
        self.client.sign_in(username, "pw").await.expect("sign in");
        let (token, mut peer) = self.next_peer().await;
        assert_eq!(token, format!("token-{username}"));
        assert_eq!(next_request(&mut peer).await, join("general"));
        self.wait_view(|view| {
            view.connection == ConnectionState::Connected
                && view.identity.as_deref() == Some(username)
        })
        .await;
        peer
    }
}

async fn next_request(peer: &mut TransportPeer) -> ClientRequest {
    timeout(WAIT, peer.next_request())
        .await
        .expect("timed out waiting for a request")
        .expect("client side closed")
}

fn join(channel: &str) -> ClientRequest {
    ClientRequest::JoinChannel(channel.into())
}

fn history_frame(entries: &[(&str, &str, &str)]) -> String {
    let messages: Vec<_> = entries
        .iter()
        .map(|(channel, user, message)| json!({"channel": channel, "user": user, "message": message}))
        .collect();
    json!({"event": "channel_history", "data": messages}).to_string()
}

fn message_frame(channel: &str, user: &str, message: &str) -> String {
    json!({
        "event": "receive_message",
        "data": {"channel": channel, "user": user, "message": message}
    })
    .to_string()
}

fn bodies(view: &ClientView) -> Vec<&str> {
    view.messages.iter().map(ChatMessage::body).collect()
}

fn drain(events: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test]
async fn switching_channels_discards_buffer_and_ignores_late_messages() {
    let mut h = Harness::start(FakeApi::new()).await;
    h.wait_view(|view| view.channels.len() == 2).await;
    let mut peer = h.connected("alice").await;

    assert!(peer.push_frame(&history_frame(&[("general", "alice", "hi")])));
    let view = h.wait_view(|view| view.sync_state == SyncState::Live).await;
    assert_eq!(bodies(&view), vec!["hi"]);
    assert_eq!(view.messages[0].author(), "alice");

    h.client.select_channel("random").await.expect("select");
    let view = h.wait_view(|view| view.active_channel == "random").await;
    assert!(view.messages.is_empty());
    assert_eq!(view.sync_state, SyncState::Switching);
    assert_eq!(next_request(&mut peer).await, join("random"));

    peer.push_frame(&message_frame("general", "bob", "late"));
    peer.push_frame(&history_frame(&[("random", "bob", "r1")]));
    peer.push_frame(&message_frame("general", "bob", "later"));
    peer.push_frame(&message_frame("random", "carol", "r2"));

    let view = h.wait_view(|view| view.messages.len() == 2).await;
    assert_eq!(bodies(&view), vec!["r1", "r2"]);
    assert!(view.messages.iter().all(|message| message.channel() == "random"));
}

#[tokio::test]
async fn returning_to_a_channel_requests_history_again() {
    let mut h = Harness::start(FakeApi::new()).await;
    h.wait_view(|view| view.channels.len() == 2).await;
    let mut peer = h.connected("alice").await;
    peer.push_frame(&history_frame(&[("general", "alice", "hi")]));
    h.wait_view(|view| view.sync_state == SyncState::Live).await;

    h.client.select_channel("random").await.expect("random");
    h.client.select_channel("general").await.expect("general");
    assert_eq!(next_request(&mut peer).await, join("random"));
    assert_eq!(next_request(&mut peer).await, join("general"));

    let view = h
        .wait_view(|view| view.active_channel == "general" && view.sync_state == SyncState::Switching)
        .await;
    assert!(view.messages.is_empty());

    // Re-selecting the active channel is a no-op.
    h.client.select_channel("general").await.expect("same");
    assert!(peer.try_next_request().is_none());
}

#[tokio::test]
async fn force_logout_mid_switch_clears_session_and_closes_transport() {
    let mut h = Harness::start(FakeApi::new()).await;
    let mut events = h.client.subscribe_events();
    let peer = h.connected("alice").await;
    assert_eq!(h.client.view().sync_state, SyncState::Switching);

    assert!(peer.push_frame(r#"{"event":"force_logout","data":"Logged in elsewhere"}"#));
    let view = h
        .wait_view(|view| view.connection == ConnectionState::Disconnected)
        .await;
    assert_eq!(view.identity, None);
    assert_eq!(view.sync_state, SyncState::Idle);
    assert!(view.messages.is_empty());
    assert!(h.client.session().is_none());
    assert!(h.store.snapshot().await.is_empty());

    assert!(peer.is_closed());
    assert!(!peer.push_frame(&history_frame(&[("general", "alice", "ghost")])));

    let seen = drain(&mut events);
    assert!(seen.iter().any(|event| matches!(
        event,
        ClientEvent::ForcedLogout { reason } if reason == "Logged in elsewhere"
    )));
    assert!(seen
        .iter()
        .any(|event| matches!(event, ClientEvent::SessionChanged { identity: None })));
}

#[tokio::test]
async fn blank_compose_makes_no_calls() {
    let mut h = Harness::start(FakeApi::new()).await;
    let mut peer = h.connected("alice").await;

    let err = h.client.compose("   ", None).await.expect_err("blank");
    assert!(matches!(err, ClientError::Validation(_)));
    assert_eq!(h.api.upload_calls.load(Ordering::SeqCst), 0);
    assert!(peer.try_next_request().is_none());
}

#[tokio::test]
async fn failed_upload_never_sends() {
    let api = FakeApi::new();
    api.set_upload(Err(ClientError::Rejected("File upload failed".into())));
    let mut h = Harness::start(api).await;
    let mut peer = h.connected("alice").await;

    let attachment = OutgoingAttachment::new("cat.png", vec![1, 2, 3]);
    let err = h
        .client
        .compose("hello", Some(attachment))
        .await
        .expect_err("upload fails");
    assert_eq!(err, ClientError::Rejected("File upload failed".into()));
    assert_eq!(h.api.upload_calls.load(Ordering::SeqCst), 1);
    assert!(peer.try_next_request().is_none());
}

#[tokio::test]
async fn compose_sends_one_event_and_leaves_buffer_alone() {
    let mut h = Harness::start(FakeApi::new()).await;
    let mut peer = h.connected("alice").await;
    peer.push_frame(&history_frame(&[("general", "bob", "earlier")]));
    h.wait_view(|view| view.sync_state == SyncState::Live).await;

    h.client.compose("hello", None).await.expect("send text");
    assert_eq!(
        next_request(&mut peer).await,
        ClientRequest::SendMessage(SendMessagePayload {
            channel: "general".into(),
            message: "hello".into(),
            file_url: None,
            file_name: None,
        })
    );

    let attachment = OutgoingAttachment::new("cat.png", vec![1, 2, 3]);
    h.client.compose("", Some(attachment)).await.expect("send file");
    assert_eq!(
        next_request(&mut peer).await,
        ClientRequest::SendMessage(SendMessagePayload {
            channel: "general".into(),
            message: String::new(),
            file_url: Some("/uploads/7-cat.png".into()),
            file_name: Some("cat.png".into()),
        })
    );
    assert_eq!(bodies(&h.client.view()), vec!["earlier"]);

    // Our own message shows up only through the server's rebroadcast.
    peer.push_frame(&message_frame("general", "alice", "hello"));
    let view = h.wait_view(|view| view.messages.len() == 2).await;
    assert_eq!(bodies(&view), vec!["earlier", "hello"]);
}

#[tokio::test]
async fn compose_requires_session() {
    let h = Harness::start(FakeApi::new()).await;
    assert_eq!(
        h.client.compose("hi", None).await,
        Err(ClientError::NotAuthenticated)
    );
}

#[tokio::test]
async fn upload_outliving_its_session_is_dropped() {
    let gate = Arc::new(Notify::new());
    let mut api = FakeApi::new();
    api.upload_gate = Some(gate.clone());
    let mut h = Harness::start(api).await;
    let _peer = h.connected("alice").await;

    let client = h.client.clone();
    let pending = tokio::spawn(async move {
        client
            .compose("look", Some(OutgoingAttachment::new("cat.png", vec![9])))
            .await
    });
    timeout(WAIT, async {
        while h.api.upload_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("upload started");

    h.client.sign_out().await.expect("sign out");
    gate.notify_one();
    let outcome = pending.await.expect("compose task");
    assert_eq!(outcome, Err(ClientError::NotAuthenticated));
}

#[tokio::test]
async fn sign_in_validates_and_surfaces_rejection() {
    let mut h = Harness::start(FakeApi::new()).await;

    let err = h.client.sign_in("   ", "pw").await.expect_err("blank");
    assert_eq!(err, ClientError::Validation("Enter username and password".into()));
    let err = h.client.sign_in("alice", "   ").await.expect_err("blank password");
    assert_eq!(err, ClientError::Validation("Enter username and password".into()));
    assert_eq!(h.api.sign_in_calls.load(Ordering::SeqCst), 0);

    let err = h.client.sign_in("alice", "wrong").await.expect_err("rejected");
    assert_eq!(err, ClientError::Rejected("Invalid credentials".into()));
    assert!(h.client.session().is_none());
    assert!(h.peers.try_recv().is_err());

    let session = h.client.sign_in("  alice  ", "pw").await.expect("trimmed");
    assert_eq!(session.identity(), "alice");
    let (token, _peer) = h.next_peer().await;
    assert_eq!(token, "token-alice");
    let saved = h.store.snapshot().await;
    assert_eq!(saved.get(TOKEN_KEY).map(String::as_str), Some("token-alice"));
    assert_eq!(saved.get(IDENTITY_KEY).map(String::as_str), Some("alice"));
}

#[tokio::test]
async fn sign_up_does_not_create_session() {
    let h = Harness::start(FakeApi::new()).await;
    let mut events = h.client.subscribe_events();

    h.client.sign_up("bob", "pw").await.expect("sign up");
    assert!(h.client.session().is_none());
    let seen = drain(&mut events);
    assert!(seen.iter().any(|event| matches!(
        event,
        ClientEvent::Notice(notice) if notice.kind == NoticeKind::Info && notice.message == SIGN_UP_SUCCESS
    )));

    let err = h.client.sign_up("taken", "pw").await.expect_err("taken");
    assert_eq!(err, ClientError::Rejected("Username already exists".into()));
}

#[tokio::test]
async fn unknown_channel_is_rejected() {
    let h = Harness::start(FakeApi::new()).await;
    h.wait_view(|view| view.channels.len() == 2).await;

    let err = h.client.select_channel("nope").await.expect_err("unknown");
    assert!(matches!(err, ClientError::Validation(_)));
    assert_eq!(h.client.view().active_channel, "general");
}

#[tokio::test]
async fn directory_failure_is_not_fatal() {
    let api = FakeApi::new();
    api.set_channels(Err(ClientError::Network("directory down".into())));
    let mut h = Harness::start(api).await;

    let err = h.client.reload_channels().await.expect_err("still down");
    assert_eq!(err, ClientError::Network("directory down".into()));
    assert!(h.client.view().channels.is_empty());

    // The default channel stays usable.
    h.client.select_channel("general").await.expect("default");
    let mut peer = h.connected("alice").await;
    peer.push_frame(&history_frame(&[("general", "bob", "hi")]));
    h.wait_view(|view| view.messages.len() == 1).await;

    h.api.set_channels(Ok(vec![Channel::new("general"), Channel::new("dev")]));
    let channels = h.client.reload_channels().await.expect("reload");
    assert_eq!(channels.len(), 2);
    h.wait_view(|view| view.channels.len() == 2).await;
    h.client.select_channel("dev").await.expect("dev");
}

#[tokio::test]
async fn persisted_session_reconnects_on_startup() {
    let store = MemoryStore::new();
    store
        .put_all(&[(TOKEN_KEY, "token-carol"), (IDENTITY_KEY, "carol")])
        .await
        .expect("seed");
    let mut h = Harness::start_with(FakeApi::new(), store, None).await;

    let (token, mut peer) = h.next_peer().await;
    assert_eq!(token, "token-carol");
    assert_eq!(next_request(&mut peer).await, join("general"));
    let view = h
        .wait_view(|view| view.connection == ConnectionState::Connected)
        .await;
    assert_eq!(view.identity.as_deref(), Some("carol"));
    assert_eq!(h.api.sign_in_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn new_token_replaces_old_transport() {
    let mut h = Harness::start(FakeApi::new()).await;
    let first = h.connected("alice").await;
    let mut second = h.connected("bob").await;

    assert!(first.is_closed());
    assert!(!first.push_frame(&history_frame(&[("general", "alice", "stale")])));

    second.push_frame(&history_frame(&[("general", "bob", "fresh")]));
    let view = h.wait_view(|view| view.sync_state == SyncState::Live).await;
    assert_eq!(bodies(&view), vec!["fresh"]);
    assert!(second.try_next_request().is_none());
}

#[tokio::test]
async fn remote_drop_reconnects_and_rejoins() {
    let mut h = Harness::start(FakeApi::new()).await;
    let peer = h.connected("alice").await;
    peer.push_frame(&history_frame(&[("general", "bob", "hi")]));
    h.wait_view(|view| view.messages.len() == 1).await;

    peer.disconnect(Some("server restart".into()));
    let (token, mut peer) = h.next_peer().await;
    assert_eq!(token, "token-alice");
    assert_eq!(next_request(&mut peer).await, join("general"));

    let view = h
        .wait_view(|view| view.connection == ConnectionState::Connected && view.messages.is_empty())
        .await;
    assert_eq!(view.identity.as_deref(), Some("alice"));
}

#[tokio::test]
async fn manual_reconnect_when_automatic_is_disabled() {
    let mut h = Harness::start_with(FakeApi::new(), MemoryStore::new(), None).await;
    let peer = h.connected("alice").await;

    peer.disconnect(None);
    let view = h
        .wait_view(|view| view.connection == ConnectionState::Disconnected)
        .await;
    assert_eq!(view.identity.as_deref(), Some("alice"));
    assert!(h.peers.try_recv().is_err());

    h.client.reconnect().await.expect("reconnect");
    let (_, mut peer) = h.next_peer().await;
    assert_eq!(next_request(&mut peer).await, join("general"));
}

#[tokio::test]
async fn failed_handshake_is_surfaced() {
    let h = Harness::start(FakeApi::new()).await;
    h.connector.refuse.store(true, Ordering::SeqCst);
    let mut events = h.client.subscribe_events();

    h.client.sign_in("alice", "pw").await.expect("sign in");
    h.wait_view(|view| view.identity.is_some() && view.connection == ConnectionState::Disconnected)
        .await;
    let seen = drain(&mut events);
    assert!(seen.iter().any(|event| matches!(
        event,
        ClientEvent::Notice(notice) if notice.kind == NoticeKind::Network
    )));
}

#[tokio::test]
async fn sign_out_is_idempotent() {
    let mut h = Harness::start(FakeApi::new()).await;
    let peer = h.connected("alice").await;

    h.client.sign_out().await.expect("first");
    h.client.sign_out().await.expect("second");
    let view = h
        .wait_view(|view| view.connection == ConnectionState::Disconnected)
        .await;
    assert_eq!(view.identity, None);
    assert!(peer.is_closed());
    assert!(h.store.snapshot().await.is_empty());
}

#[tokio::test]
async fn shutdown_stops_the_runtime() {
    let mut h = Harness::start(FakeApi::new()).await;
    let peer = h.connected("alice").await;

    h.client.shutdown().await;
    assert!(peer.is_closed());
    assert_eq!(
        h.client.sign_in("alice", "pw").await,
        Err(ClientError::Shutdown)
    );
}
