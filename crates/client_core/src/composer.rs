//! Turns what the user typed (and optionally attached) into one outbound
//! `send_message`. Nothing here touches the conversation buffer; the sender
//! sees their own message when the server rebroadcasts it.

use shared::protocol::{ClientRequest, SendMessagePayload, UploadResponse};

use crate::{api::OutgoingAttachment, error::ClientError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub attachment: Option<OutgoingAttachment>,
}

impl Draft {
    /// Rejects a draft with neither visible text nor an attachment.
    pub fn new(text: impl Into<String>, attachment: Option<OutgoingAttachment>) -> Result<Self, ClientError> {
        let text = text.into();
        if text.trim().is_empty() && attachment.is_none() {
            return Err(ClientError::Validation(
                "Type a message or attach a file".into(),
            ));
        }
        Ok(Self { text, attachment })
    }

    /// Splits off the attachment that still has to be uploaded.
    pub fn take_attachment(&mut self) -> Option<OutgoingAttachment> {
        self.attachment.take()
    }
}

/// The single outbound event for `text`, referencing `upload` when a file
/// went up first. Text is sent as typed.
pub fn send_request(channel: &str, text: String, upload: Option<UploadResponse>) -> ClientRequest {
    let (file_url, file_name) = match upload {
        Some(stored) => (Some(stored.url), Some(stored.original_name)),
        None => (None, None),
    };
    ClientRequest::SendMessage(SendMessagePayload {
        channel: channel.to_string(),
        message: text,
        file_url,
        file_name,
    })
}
