//! HTTP side of the chat server: authentication, channel directory and file
//! upload.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response,
};
use shared::{
    domain::{Channel, Session},
    error::ApiError,
    protocol::{Credentials, SignInResponse, UploadResponse},
};
use tracing::{debug, info};
use url::Url;

use crate::error::ClientError;

const DEFAULT_AUTH_FAILURE: &str = "Auth failed";
const DEFAULT_UPLOAD_FAILURE: &str = "File upload failed";

#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ClientError>;
    async fn sign_up(&self, credentials: &Credentials) -> Result<(), ClientError>;
    async fn list_channels(&self) -> Result<Vec<Channel>, ClientError>;
    async fn upload(&self, attachment: OutgoingAttachment) -> Result<UploadResponse, ClientError>;
}

/// A file the user wants to send along with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingAttachment {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl OutgoingAttachment {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let file_name = file_name.into();
        let mime_type = mime_guess::from_path(&file_name)
            .first_raw()
            .map(str::to_string);
        Self {
            file_name,
            mime_type,
            bytes,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                ClientError::Validation(format!("'{}' is not a file path", path.display()))
            })?;
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            ClientError::Validation(format!("cannot read '{}': {err}", path.display()))
        })?;
        Ok(Self::new(file_name, bytes))
    }
}

pub struct HttpChatApi {
    http: Client,
    server_url: Url,
}

impl HttpChatApi {
    pub fn new(server_url: Url, request_timeout: Duration) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self { http, server_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.server_url
            .join(path)
            .map_err(|err| ClientError::Validation(format!("invalid server url: {err}")))
    }
}

/// Turns a non-2xx response into a rejection carrying the server's own
/// `error` text when it sent one.
async fn rejection(response: Response, fallback: &str) -> ClientError {
    let status = response.status();
    let message = response
        .json::<ApiError>()
        .await
        .ok()
        .map(|body| body.error)
        .filter(|message| !message.trim().is_empty())
        .unwrap_or_else(|| fallback.to_string());
    debug!(%status, %message, "api: request rejected");
    ClientError::Rejected(message)
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn sign_in(&self, credentials: &Credentials) -> Result<Session, ClientError> {
        let response = self
            .http
            .post(self.endpoint("signin")?)
            .json(credentials)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response, DEFAULT_AUTH_FAILURE).await);
        }
        let body: SignInResponse = response.json().await?;
        info!(username = %body.username, "api: signed in");
        Session::new(body.username, body.token)
            .ok_or_else(|| ClientError::Rejected("server returned an incomplete session".into()))
    }

    async fn sign_up(&self, credentials: &Credentials) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.endpoint("signup")?)
            .json(credentials)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response, DEFAULT_AUTH_FAILURE).await);
        }
        info!(username = %credentials.username, "api: signed up");
        Ok(())
    }

    async fn list_channels(&self) -> Result<Vec<Channel>, ClientError> {
        let names: Vec<String> = self
            .http
            .get(self.endpoint("channels")?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(names.into_iter().map(Channel::new).collect())
    }

    async fn upload(&self, attachment: OutgoingAttachment) -> Result<UploadResponse, ClientError> {
        let size = attachment.bytes.len();
        let mut part = Part::bytes(attachment.bytes).file_name(attachment.file_name.clone());
        if let Some(mime_type) = attachment.mime_type.as_deref() {
            part = part.mime_str(mime_type)?;
        }
        let response = self
            .http
            .post(self.endpoint("upload")?)
            .multipart(Form::new().part("file", part))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(rejection(response, DEFAULT_UPLOAD_FAILURE).await);
        }
        let stored: UploadResponse = response.json().await?;
        info!(
            file_name = %attachment.file_name,
            size,
            url = %stored.url,
            "api: uploaded attachment"
        );
        Ok(stored)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
