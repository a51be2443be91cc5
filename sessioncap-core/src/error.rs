//! Error types for sessioncap-core

use thiserror::Error;

/// Body the ingest service returns when it declines a session on purpose.
pub const CANCELED: &str = "canceled";

/// Main error type for the sessioncap-core library
#[derive(Error, Debug)]
pub enum Error {
    /// No transport worker could be created for this instance
    #[error("no transport available: perhaps the worker could not be spawned")]
    NoTransport,

    /// `start` was called on an instance that is not idle
    #[error("trying to call `start()` on an instance that has been started already")]
    AlreadyStarted,

    /// The ingest service declined the session with the cancellation marker
    #[error("{CANCELED}")]
    Canceled,

    /// The ingest service rejected the start request
    #[error("server error: {status}. {body}")]
    Server { status: u16, body: String },

    /// The start response did not have the expected shape
    #[error("incorrect server response: {0}")]
    IncorrectResponse(String),

    /// A `stop` or restart happened while `start` was suspended
    #[error("start was interrupted by a concurrent stop")]
    Interrupted,

    /// Transport protocol misuse or a closed worker channel
    #[error("transport error: {0}")]
    Transport(String),

    /// HTTP error talking to the ingest service
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL in options or arguments
    #[error("invalid URL: {0}")]
    Url(String),

    /// Persisted state could not be read or written
    #[error("storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True when the server declined the session, as opposed to failing.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }

    /// Whether a failed start should go to the diagnostic channel.
    ///
    /// Cancellation, double starts and interrupted starts are expected
    /// outcomes and are not reported.
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            Error::Canceled | Error::AlreadyStarted | Error::Interrupted
        )
    }
}

/// Result type alias for sessioncap-core
pub type Result<T> = std::result::Result<T, Error>;
