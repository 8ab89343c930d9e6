use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};
use telecache_service::caching::FetchError;

/// The status code a failed retrieval is answered with.
pub fn fetch_error_status(error: &FetchError) -> StatusCode {
    match error {
        FetchError::NotFoundUpstream => StatusCode::NOT_FOUND,
        FetchError::InvalidObjectId(_) => StatusCode::BAD_REQUEST,
        FetchError::AlreadyInProgress => StatusCode::CONFLICT,
        FetchError::TooManyInflight | FetchError::QueueFull | FetchError::RuntimeNotStarted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FetchError::Transport(_) | FetchError::Session(_) => StatusCode::BAD_GATEWAY,
        FetchError::CacheIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
}

impl From<FetchError> for ResponseError {
    fn from(err: FetchError) -> Self {
        Self {
            status: fetch_error_status(&err),
            err: err.into(),
        }
    }
}

impl From<anyhow::Error> for ResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err,
        }
    }
}

impl From<std::io::Error> for ResponseError {
    fn from(err: std::io::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse { detail, causes }
    }
}

/// The body of endpoints that trigger an action on the cache.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn success(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
        })
    }

    pub fn failure(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: false,
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn test_fetch_error_status() {
        let status = |err| ResponseError::from(err).status;

        assert_eq!(status(FetchError::NotFoundUpstream), StatusCode::NOT_FOUND);
        assert_eq!(status(FetchError::AlreadyInProgress), StatusCode::CONFLICT);
        assert_eq!(
            status(FetchError::QueueFull),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(FetchError::Session("Unauthorized".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(FetchError::CacheIo(io::ErrorKind::PermissionDenied.into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_chain() {
        let err = anyhow::Error::from(FetchError::CacheIo(io::Error::other("disk full")));
        let response = ApiErrorResponse::from(err);

        insta::assert_json_snapshot!(response, @r###"
        {
          "detail": "cache i/o error",
          "causes": [
            "disk full"
          ]
        }
        "###);
    }
}
