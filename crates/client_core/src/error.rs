use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// Rejected locally before any network call was made.
    #[error("{0}")]
    Validation(String),
    /// A service answered with a non-2xx status; the message is the server's own.
    #[error("{0}")]
    Rejected(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("you must be logged in")]
    NotAuthenticated,
    #[error("not connected to the chat server")]
    NotConnected,
    #[error("client runtime has shut down")]
    Shutdown,
}

impl ClientError {
    pub fn notice_kind(&self) -> NoticeKind {
        match self {
            ClientError::Validation(_) | ClientError::NotAuthenticated => NoticeKind::Validation,
            ClientError::Rejected(_) => NoticeKind::Rejected,
            ClientError::Network(_) | ClientError::NotConnected => NoticeKind::Network,
            ClientError::Shutdown => NoticeKind::Internal,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Network(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Info,
    Validation,
    Rejected,
    Network,
    Internal,
}

/// A user-facing message raised by the core outside of a direct call result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Info,
            message: message.into(),
        }
    }
}

impl From<&ClientError> for Notice {
    fn from(err: &ClientError) -> Self {
        Self {
            kind: err.notice_kind(),
            message: err.to_string(),
        }
    }
}
