use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::MessageError;

/// An authenticated identity together with the opaque token the auth service
/// issued for it. Never exists half-populated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    identity: String,
    token: String,
}

impl Session {
    pub fn new(identity: impl Into<String>, token: impl Into<String>) -> Option<Self> {
        let identity = identity.into();
        let token = token.into();
        if identity.trim().is_empty() || token.trim().is_empty() {
            return None;
        }
        Some(Self { identity, token })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("identity", &self.identity)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Channel {
    pub name: String,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Server-assigned message identifier. The server may hand out either numeric
/// or string ids, so both are preserved as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    Text(String),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(id) => write!(f, "{id}"),
            MessageId::Text(id) => f.write_str(id),
        }
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Stored-object path as returned by the upload endpoint, usually
    /// relative to the server root (e.g. `/uploads/abc.png`).
    pub url: String,
    pub display_name: String,
}

impl Attachment {
    pub fn new(url: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            display_name: display_name.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.display_name
            .rsplit_once('.')
            .map(|(_, ext)| {
                IMAGE_EXTENSIONS
                    .iter()
                    .any(|candidate| ext.eq_ignore_ascii_case(candidate))
            })
            .unwrap_or(false)
    }

    /// Absolute location of the stored object. Absolute urls are returned
    /// unchanged, server-relative paths are joined onto `server`.
    pub fn resolve_url(&self, server: &Url) -> Result<Url, url::ParseError> {
        match Url::parse(&self.url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => server.join(&self.url),
            Err(err) => Err(err),
        }
    }
}

/// A single chat message. Either `body` is non-blank or an attachment is
/// present; construction enforces this so every value in a buffer is
/// renderable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    id: Option<MessageId>,
    channel: String,
    author: String,
    body: String,
    attachment: Option<Attachment>,
    sent_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(
        channel: impl Into<String>,
        author: impl Into<String>,
        body: impl Into<String>,
        attachment: Option<Attachment>,
    ) -> Result<Self, MessageError> {
        let channel = channel.into();
        let author = author.into();
        let body = body.into();
        if channel.is_empty() {
            return Err(MessageError::MissingChannel);
        }
        if body.is_empty() && attachment.is_none() {
            return Err(MessageError::Empty);
        }
        Ok(Self {
            id: None,
            channel,
            author,
            body,
            attachment,
            sent_at: None,
        })
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    pub fn id(&self) -> Option<&MessageId> {
        self.id.as_ref()
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }
}
