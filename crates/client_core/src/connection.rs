//! Owns the single transport handle bound to the current session token.
//!
//! Every connection attempt reserves a fresh [`ConnectionId`]. Handshake
//! results and inbound events carry the id they belong to, and anything
//! tagged with an id other than the current one is refused, so a replaced or
//! torn-down handle can never leak events into the core.

use shared::protocol::ClientRequest;
use tracing::{debug, info};

use crate::transport::{TransportError, TransportEvent, TransportHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Where outbound requests go. Emitting never awaits.
pub trait OutboundSink {
    fn emit(&mut self, request: ClientRequest) -> Result<(), TransportError>;
}

#[derive(Debug)]
pub struct ConnectionManager {
    state: ConnectionState,
    generation: u64,
    current: Option<ConnectionId>,
    handle: Option<TransportHandle>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: 0,
            current: None,
            handle: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn current_id(&self) -> Option<ConnectionId> {
        self.current
    }

    pub fn current_handle(&self) -> Option<&TransportHandle> {
        self.handle.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Whether events or results tagged with `id` may still be processed.
    pub fn accepts(&self, id: ConnectionId) -> bool {
        self.current == Some(id)
    }

    /// Drops whatever handle exists and reserves an id for a new attempt.
    pub fn begin_connect(&mut self) -> ConnectionId {
        self.drop_handle();
        self.generation += 1;
        let id = ConnectionId(self.generation);
        self.current = Some(id);
        self.state = ConnectionState::Connecting;
        debug!(connection = id.0, "connection: connecting");
        id
    }

    /// Installs the handle produced by attempt `id`. A stale attempt gets its
    /// handle back so the caller can close it.
    pub fn install(&mut self, id: ConnectionId, handle: TransportHandle) -> Result<(), TransportHandle> {
        if !self.accepts(id) || self.state != ConnectionState::Connecting {
            debug!(connection = id.0, "connection: discarding stale handshake");
            return Err(handle);
        }
        self.handle = Some(handle);
        self.state = ConnectionState::Connected;
        info!(connection = id.0, "connection: connected");
        Ok(())
    }

    /// Records a failed handshake for attempt `id`; `false` if it was stale.
    pub fn connect_failed(&mut self, id: ConnectionId) -> bool {
        if !self.accepts(id) || self.state != ConnectionState::Connecting {
            return false;
        }
        self.current = None;
        self.state = ConnectionState::Disconnected;
        true
    }

    /// The remote side went away. `false` if `id` is not the live connection.
    pub fn remote_disconnected(&mut self, id: ConnectionId) -> bool {
        if !self.accepts(id) {
            return false;
        }
        self.drop_handle();
        self.current = None;
        self.state = ConnectionState::Disconnected;
        info!(connection = id.0, "connection: lost");
        true
    }

    /// Local teardown (logout, forced termination). Invalidates any attempt
    /// in flight as well. Returns whether anything was torn down.
    pub fn teardown(&mut self) -> bool {
        let had_any = self.current.take().is_some();
        self.drop_handle();
        self.state = ConnectionState::Disconnected;
        if had_any {
            info!("connection: torn down");
        }
        had_any
    }

    /// Next inbound event from the live handle. Pending forever while there
    /// is none, so it can sit in a `select!` unconditionally.
    pub async fn next_event(&mut self) -> (ConnectionId, TransportEvent) {
        match (self.current, self.handle.as_mut()) {
            (Some(id), Some(handle)) => match handle.recv().await {
                Some(event) => (id, event),
                None => (id, TransportEvent::Disconnected { reason: None }),
            },
            _ => std::future::pending().await,
        }
    }

    fn drop_handle(&mut self) {
        if self.handle.take().is_some() {
            debug!("connection: released transport handle");
        }
    }
}

impl OutboundSink for ConnectionManager {
    fn emit(&mut self, request: ClientRequest) -> Result<(), TransportError> {
        match (&self.handle, self.state) {
            (Some(handle), ConnectionState::Connected) => {
                debug!(event = request.name(), "connection: emit");
                handle.emit(request)
            }
            _ => Err(TransportError::Closed),
        }
    }
}
