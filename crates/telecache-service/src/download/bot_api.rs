//! Client for the HTTP bot API.
//!
//! Resolving an object is a two step process: `getFile` returns a `file_path`, which is then
//! downloaded from the file endpoint. The public bot API refuses to resolve objects above its
//! size ceiling, answering `400` with a description mentioning that the file is too big. That
//! answer is surfaced as [`GetFileError::TooBig`] so that callers can fall back to the session
//! runtime.

use std::fmt;

use futures::TryStreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::{ByteStream, FetchError};

/// The marker in a `400` response body that signals an object above the size ceiling.
const FILE_TOO_BIG: &str = "file is too big";

/// The envelope of every bot API response.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

/// A file as resolved by `getFile`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    pub file_id: String,
    #[serde(default)]
    pub file_unique_id: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    /// Relative path for the file endpoint.
    ///
    /// A self-hosted server running in local mode answers with an absolute path on its disk.
    #[serde(default)]
    pub file_path: Option<String>,
}

/// The identity of the bot, as returned by `getMe`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// Errors resolving a file through `getFile`.
#[derive(Debug, Error)]
pub enum GetFileError {
    /// The object is above the size ceiling of this API.
    #[error("file is too big for the bot api")]
    TooBig,
    /// The API does not know the object, or could not resolve it to a path.
    #[error("file not found")]
    NotFound,
    /// The API answered with an unexpected status.
    #[error("unexpected status {0}")]
    Status(StatusCode),
    #[error("request failed")]
    Transport(#[from] reqwest::Error),
}

impl From<GetFileError> for FetchError {
    fn from(error: GetFileError) -> Self {
        match error {
            // callers are expected to handle this one before converting
            GetFileError::TooBig => FetchError::Transport("file is too big for the bot api".into()),
            GetFileError::NotFound | GetFileError::Status(_) => FetchError::NotFoundUpstream,
            GetFileError::Transport(err) => FetchError::transport(&err),
        }
    }
}

/// A client for one bot API endpoint and token.
#[derive(Clone)]
pub struct BotApiClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl fmt::Debug for BotApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BotApiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl BotApiClient {
    pub fn new(client: reqwest::Client, base_url: &str, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    /// The download URL for a `file_path` returned by [`get_file`](Self::get_file).
    pub fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.base_url,
            self.token,
            file_path.trim_start_matches('/')
        )
    }

    /// Checks the token and returns the identity of the bot.
    pub async fn get_me(&self) -> Result<BotUser, FetchError> {
        let response = self.client.get(self.method_url("getMe")).send().await?;
        let status = response.status();
        let body = response.text().await?;
        match parse_envelope::<BotUser>(&body) {
            Some(ApiResponse {
                ok: true,
                result: Some(user),
                ..
            }) => Ok(user),
            Some(ApiResponse { description, .. }) => Err(FetchError::Session(
                description.unwrap_or_else(|| format!("getMe failed with status {status}")),
            )),
            None => Err(FetchError::Session(format!(
                "getMe failed with status {status}"
            ))),
        }
    }

    /// Resolves `file_id` to a downloadable file.
    #[tracing::instrument(skip(self))]
    pub async fn get_file(&self, file_id: &str) -> Result<RemoteFile, GetFileError> {
        let response = self
            .client
            .get(self.method_url("getFile"))
            .query(&[("file_id", file_id)])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::BAD_REQUEST && body.contains(FILE_TOO_BIG) {
            tracing::debug!("Object exceeds the bot api size ceiling");
            return Err(GetFileError::TooBig);
        }
        if !status.is_success() {
            tracing::debug!(%status, "getFile failed");
            return match status {
                StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => Err(GetFileError::NotFound),
                _ => Err(GetFileError::Status(status)),
            };
        }

        match parse_envelope::<RemoteFile>(&body) {
            Some(ApiResponse {
                ok: true,
                result: Some(file),
                ..
            }) if file.file_path.is_some() => Ok(file),
            Some(response) => {
                tracing::debug!(description = ?response.description, "getFile returned no file");
                Err(GetFileError::NotFound)
            }
            None => Err(GetFileError::NotFound),
        }
    }

    /// Starts downloading `file_path` and returns the response body as a stream.
    pub async fn download(&self, file_path: &str) -> Result<ByteStream, FetchError> {
        let response = self.client.get(self.file_url(file_path)).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFoundUpstream);
        }
        if !status.is_success() {
            return Err(FetchError::Transport(format!(
                "file download failed with status {status}"
            )));
        }

        Ok(Box::pin(response.bytes_stream().map_err(FetchError::from)))
    }
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Option<ApiResponse<T>> {
    match serde_json::from_str(body) {
        Ok(response) => Some(response),
        Err(err) => {
            tracing::debug!(error = &err as &dyn std::error::Error, "Invalid bot api response");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = BotApiClient::new(reqwest::Client::new(), "http://localhost:8081/", "123:abc");

        assert_eq!(
            client.method_url("getFile"),
            "http://localhost:8081/bot123:abc/getFile"
        );
        assert_eq!(
            client.file_url("documents/file_1.mp4"),
            "http://localhost:8081/file/bot123:abc/documents/file_1.mp4"
        );
    }

    #[test]
    fn test_parse_envelope() {
        let body = r#"{"ok":true,"result":{"file_id":"abc","file_size":3,"file_path":"docs/abc"}}"#;
        let response = parse_envelope::<RemoteFile>(body).unwrap();

        assert!(response.ok);
        assert_eq!(
            response.result.unwrap(),
            RemoteFile {
                file_id: "abc".into(),
                file_unique_id: None,
                file_size: Some(3),
                file_path: Some("docs/abc".into()),
            }
        );

        let body = r#"{"ok":false,"error_code":400,"description":"Bad Request: file is too big"}"#;
        let response = parse_envelope::<RemoteFile>(body).unwrap();
        assert!(!response.ok);
        assert!(response.description.unwrap().contains(FILE_TOO_BIG));

        assert!(parse_envelope::<RemoteFile>("<html>").is_none());
    }

    #[tokio::test]
    async fn test_get_file_against_mock() {
        telecache_test::setup();
        let server = telecache_test::MockBotApi::public("123:abc", 10);
        server.add_file("small", vec![1; 10]);
        server.add_file("big", vec![1; 11]);
        let client = BotApiClient::new(reqwest::Client::new(), &server.url(), "123:abc");

        let file = client.get_file("small").await.unwrap();
        assert_eq!(file.file_path.as_deref(), Some("documents/small"));
        assert_eq!(file.file_size, Some(10));

        assert!(matches!(
            client.get_file("big").await,
            Err(GetFileError::TooBig)
        ));
        assert!(matches!(
            client.get_file("unknown").await,
            Err(GetFileError::NotFound)
        ));

        let wrong_token = BotApiClient::new(reqwest::Client::new(), &server.url(), "456:def");
        assert!(matches!(
            wrong_token.get_file("small").await,
            Err(GetFileError::Status(StatusCode::UNAUTHORIZED))
        ));
        assert!(matches!(
            wrong_token.get_me().await,
            Err(FetchError::Session(_))
        ));
    }

    #[test]
    fn test_get_file_error_conversion() {
        assert!(matches!(
            FetchError::from(GetFileError::NotFound),
            FetchError::NotFoundUpstream
        ));
        assert!(matches!(
            FetchError::from(GetFileError::Status(StatusCode::BAD_GATEWAY)),
            FetchError::NotFoundUpstream
        ));
    }
}
