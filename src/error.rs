use std::sync::Arc;

use thiserror::Error;

/// Represents a result type for operations in the PostHog SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the PostHog SDK.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Project API key is missing or empty.
    #[error("project api_key is required")]
    MissingApiKey,

    /// The operation requires a personal API key (local evaluation, remote config payloads).
    #[error("personal_api_key is required for this operation")]
    PersonalApiKeyRequired,

    /// Invalid host configuration.
    #[error("invalid host configuration")]
    InvalidHostUrl(#[source] url::ParseError),

    /// Settings could not be bound from a configuration document.
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// The project is over its quota and the server refused to serve the resource.
    #[error("quota limited")]
    QuotaLimited,

    /// The server responded with an unexpected HTTP status.
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),

    /// Background thread (flusher or poller) panicked. This should normally never happen.
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),

    /// The client has been shut down and cannot accept more work.
    #[error("client is shut down")]
    Shutdown,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Response body could not be parsed.
    #[error("error parsing server response")]
    Json(#[source] Arc<serde_json::Error>),
}

impl Error {
    /// Return `true` if the failed request may succeed when retried later.
    pub(crate) fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::UnexpectedStatus(status) => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
