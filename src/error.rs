use std::time::Duration;
use thiserror::Error;

/// Errors produced by the logging pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] Box<ureq::Error>),

    #[error("transport rejected {count} entries: {message}")]
    Transport { count: usize, message: String },

    #[error("flush did not complete within {0:?}")]
    FlushTimeout(Duration),

    #[error("sink writer is shut down")]
    SinkClosed,

    #[error("invalid severity: {0}")]
    InvalidSeverity(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid log entry: {0}")]
    InvalidEntry(String),

    /// Raised by [`RequestLogger::panic`](crate::RequestLogger::panic) after the
    /// entry has been flushed. Carries the rendered message.
    #[error("{0}")]
    Alert(String),
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        Error::Http(Box::new(err))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
