use std::io;

use thiserror::Error;

/// An error that happens when retrieving an object.
///
/// Errors raised on the session runtime travel to the requesting side as values through the job's
/// result channel, which is why this type is `Send` and carries no borrowed data.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The platform does not know the object, or refused to resolve it.
    #[error("object not found upstream")]
    NotFoundUpstream,
    /// A network or protocol failure on either transport.
    #[error("transfer failed: {0}")]
    Transport(String),
    /// The session transport failed, e.g. it could not authenticate.
    #[error("session error: {0}")]
    Session(String),
    /// An oversized object needs the session runtime, but it is not running.
    #[error("session runtime is not running")]
    RuntimeNotStarted,
    /// The session runtime has too many pending jobs.
    #[error("session runtime queue is full")]
    QueueFull,
    /// Reading or writing the on-disk cache failed.
    #[error("cache i/o error")]
    CacheIo(#[from] io::Error),
    /// The object id cannot be used as a file name in the cache directory.
    #[error("invalid object id `{0}`")]
    InvalidObjectId(String),
    /// A background download of the same object is already running.
    #[error("caching is already in progress for this file")]
    AlreadyInProgress,
    /// Too many background downloads are running.
    #[error("too many background downloads in progress")]
    TooManyInflight,
}

impl FetchError {
    /// Builds a [`Transport`](Self::Transport) error from the innermost cause of `error`.
    pub fn transport(mut error: &dyn std::error::Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }
        Self::Transport(error.to_string())
    }

    /// A short name used to tag metrics.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            Self::NotFoundUpstream => "notfound",
            Self::Transport(_) => "transport",
            Self::Session(_) => "session",
            Self::RuntimeNotStarted => "notstarted",
            Self::QueueFull => "queuefull",
            Self::CacheIo(_) => "cacheio",
            Self::InvalidObjectId(_) => "invalid",
            Self::AlreadyInProgress => "inprogress",
            Self::TooManyInflight => "toomany",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        Self::transport(&error)
    }
}
