use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{Attachment, ChatMessage, MessageId},
    error::MessageError,
};

/// Events the client emits over the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinChannel(String),
    SendMessage(SendMessagePayload),
}

impl ClientRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::JoinChannel(_) => "join_channel",
            ClientRequest::SendMessage(_) => "send_message",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub channel: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Events the server pushes over the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ChannelHistory(HistoryPayload),
    ReceiveMessage(MessagePayload),
    ForceLogout(String),
}

pub const DEFAULT_FORCE_LOGOUT_REASON: &str = "You have been logged out by the server";

impl ServerEvent {
    /// Decodes one text frame. A `force_logout` frame whose reason is missing
    /// or malformed still decodes, with a generic reason.
    pub fn from_frame(text: &str) -> Result<Self, serde_json::Error> {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => Ok(event),
            Err(err) => {
                let is_force_logout = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|raw| {
                        raw.get("event")
                            .and_then(Value::as_str)
                            .map(|name| name == "force_logout")
                    })
                    .unwrap_or(false);
                if is_force_logout {
                    Ok(ServerEvent::ForceLogout(DEFAULT_FORCE_LOGOUT_REASON.to_string()))
                } else {
                    Err(err)
                }
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ChannelHistory(_) => "channel_history",
            ServerEvent::ReceiveMessage(_) => "receive_message",
            ServerEvent::ForceLogout(_) => "force_logout",
        }
    }
}

/// History is accepted both as a bare list and tagged with the channel it
/// answers. Entries stay raw so one malformed entry does not poison the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryPayload {
    Tagged {
        channel: String,
        messages: Vec<Value>,
    },
    Bare(Vec<Value>),
}

impl HistoryPayload {
    pub fn into_parts(self) -> (Option<String>, Vec<Value>) {
        match self {
            HistoryPayload::Tagged { channel, messages } => (Some(channel), messages),
            HistoryPayload::Bare(messages) => (None, messages),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TryFrom<MessagePayload> for ChatMessage {
    type Error = MessageError;

    fn try_from(payload: MessagePayload) -> Result<Self, Self::Error> {
        let attachment = match payload.file_url {
            Some(url) if url.trim().is_empty() => return Err(MessageError::BlankAttachmentUrl),
            Some(url) => {
                let display_name = payload
                    .file_name
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| {
                        url.rsplit('/')
                            .find(|segment| !segment.is_empty())
                            .unwrap_or(url.as_str())
                            .to_string()
                    });
                Some(Attachment::new(url, display_name))
            }
            None => None,
        };

        let mut message = ChatMessage::new(
            payload.channel.unwrap_or_default(),
            payload.user.unwrap_or_default(),
            payload.message.unwrap_or_default(),
            attachment,
        )?;
        if let Some(id) = payload.id {
            message = message.with_id(id);
        }
        if let Some(sent_at) = payload
            .timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        {
            message = message.with_sent_at(sent_at.with_timezone(&Utc));
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInResponse {
    pub token: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub url: String,
    pub original_name: String,
}
