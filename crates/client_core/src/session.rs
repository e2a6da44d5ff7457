//! The single owned cell holding the authenticated session.
//!
//! Every mutation funnels through [`SessionStore::authenticate`] or
//! [`SessionStore::clear`]; observers subscribe to the `watch` channel rather
//! than polling.

use std::sync::Arc;

use shared::domain::Session;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::kv::KeyValueStore;

pub const TOKEN_KEY: &str = "token";
pub const IDENTITY_KEY: &str = "username";

pub struct SessionStore {
    cell: watch::Sender<Option<Session>>,
    persistence: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(persistence: Arc<dyn KeyValueStore>) -> Self {
        let (cell, _) = watch::channel(None);
        Self { cell, persistence }
    }

    pub fn current(&self) -> Option<Session> {
        self.cell.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.cell.borrow().is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.cell.subscribe()
    }

    /// Adopts a previously persisted session if both of its entries are
    /// present. Storage failures leave the store empty.
    pub async fn restore(&self) -> Option<Session> {
        let token = self.read(TOKEN_KEY).await;
        let identity = self.read(IDENTITY_KEY).await;
        let session = match (identity, token) {
            (Some(identity), Some(token)) => Session::new(identity, token),
            _ => None,
        };
        match &session {
            Some(session) => {
                debug!(identity = session.identity(), "session: restored from storage");
                self.cell.send_replace(Some(session.clone()));
            }
            None => debug!("session: nothing to restore"),
        }
        session
    }

    /// Replaces the in-memory session and persists it. Returns `true` when the
    /// token differs from the one held before.
    pub async fn authenticate(&self, session: Session) -> bool {
        let previous = self.cell.send_replace(Some(session.clone()));
        let token_changed = previous
            .as_ref()
            .map(|previous| previous.token() != session.token())
            .unwrap_or(true);

        if let Err(err) = self
            .persistence
            .put_all(&[
                (TOKEN_KEY, session.token()),
                (IDENTITY_KEY, session.identity()),
            ])
            .await
        {
            warn!(error = %err, "session: failed to persist session");
        }
        token_changed
    }

    /// Drops the session from memory and storage. Safe to call repeatedly;
    /// returns whether a session was actually held.
    pub async fn clear(&self) -> bool {
        let had_session = self.cell.send_if_modified(|current| current.take().is_some());
        if let Err(err) = self
            .persistence
            .remove_all(&[TOKEN_KEY, IDENTITY_KEY])
            .await
        {
            warn!(error = %err, "session: failed to remove persisted session");
        }
        if had_session {
            debug!("session: cleared");
        }
        had_session
    }

    async fn read(&self, key: &str) -> Option<String> {
        match self.persistence.get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key, error = %err, "session: failed to read persisted entry");
                None
            }
        }
    }
}
