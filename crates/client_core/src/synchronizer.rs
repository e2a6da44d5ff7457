//! Keeps the conversation buffer for exactly one active channel.
//!
//! The buffer is never merged with earlier state: every channel change and
//! every (re)connection discards it and asks the server for fresh history.
//! Discarding and emitting the join happen in the same synchronous call, so
//! no inbound message can land in between.

use shared::{domain::ChatMessage, protocol::ClientRequest};
use tracing::debug;

use crate::connection::OutboundSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No live connection to sync over.
    Idle,
    /// Join sent, waiting for history.
    Switching,
    /// History applied; live messages are appended.
    Live,
}

#[derive(Debug, Clone)]
pub struct ConversationSynchronizer {
    active: String,
    state: SyncState,
    buffer: Vec<ChatMessage>,
}

impl ConversationSynchronizer {
    pub fn new(initial_channel: impl Into<String>) -> Self {
        Self {
            active: initial_channel.into(),
            state: SyncState::Idle,
            buffer: Vec::new(),
        }
    }

    pub fn active_channel(&self) -> &str {
        &self.active
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn buffer(&self) -> &[ChatMessage] {
        &self.buffer
    }

    /// Makes `channel` the active one and rejoins. Returns `false` when it was
    /// already active, in which case nothing happens.
    pub fn select_channel(&mut self, channel: &str, sink: &mut dyn OutboundSink) -> bool {
        if channel == self.active {
            return false;
        }
        debug!(from = %self.active, to = channel, "sync: switching channel");
        self.active = channel.to_string();
        self.resync(sink);
        true
    }

    /// A fresh transport is live: whatever was buffered belongs to the old
    /// connection and is discarded, even for the same channel.
    pub fn on_transport_ready(&mut self, sink: &mut dyn OutboundSink) {
        self.resync(sink);
    }

    /// The session ended.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = SyncState::Idle;
    }

    /// Applies a history delivery. Returns the resulting buffer length, or
    /// `None` when the delivery was discarded.
    pub fn on_history(&mut self, channel: Option<&str>, messages: Vec<ChatMessage>) -> Option<usize> {
        if self.state == SyncState::Idle {
            debug!("sync: history while idle, dropped");
            return None;
        }
        if let Some(tag) = channel {
            if tag != self.active {
                debug!(tagged = tag, active = %self.active, "sync: stale history dropped");
                return None;
            }
        } else if !messages.is_empty()
            && messages.iter().all(|message| message.channel() != self.active)
        {
            debug!(active = %self.active, "sync: untagged history for another channel dropped");
            return None;
        }

        let delivered = messages.len();
        self.buffer = messages
            .into_iter()
            .filter(|message| message.channel() == self.active)
            .collect();
        if self.buffer.len() != delivered {
            debug!(
                dropped = delivered - self.buffer.len(),
                "sync: history entries for other channels dropped"
            );
        }
        self.state = SyncState::Live;
        Some(self.buffer.len())
    }

    /// Appends a live message if it belongs to the active channel. Messages
    /// for other channels are not kept anywhere.
    pub fn on_message(&mut self, message: ChatMessage) -> bool {
        if self.state != SyncState::Live {
            debug!(state = ?self.state, "sync: message before history, dropped");
            return false;
        }
        if message.channel() != self.active {
            debug!(channel = message.channel(), active = %self.active, "sync: foreign message dropped");
            return false;
        }
        self.buffer.push(message);
        true
    }

    fn resync(&mut self, sink: &mut dyn OutboundSink) {
        self.buffer.clear();
        match sink.emit(ClientRequest::JoinChannel(self.active.clone())) {
            Ok(()) => self.state = SyncState::Switching,
            Err(err) => {
                debug!(channel = %self.active, error = %err, "sync: join deferred until connected");
                self.state = SyncState::Idle;
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/synchronizer_tests.rs"]
mod tests;
