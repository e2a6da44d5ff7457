use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error body returned by the HTTP services alongside a non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
}

impl ApiError {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Reasons an inbound message payload cannot become a [`crate::domain::ChatMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("message has neither text nor attachment")]
    Empty,
    #[error("message is missing its channel")]
    MissingChannel,
    #[error("attachment url is blank")]
    BlankAttachmentUrl,
}
