//! Error taxonomy for the mogile client

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No pooled connection became available within the lease timeout.
    #[error("connection pool exhausted after {0:?}")]
    PoolTimeout(Duration),

    /// Every configured tracker address failed for one logical operation.
    #[error("no tracker reachable: {0}")]
    TrackerUnavailable(String),

    /// The tracker understood the request and rejected it. Never retried.
    #[error("tracker error {code}: {message}")]
    Protocol { code: String, message: String },

    /// The key does not resolve to any replica.
    #[error("key not found: {0}")]
    NotFound(String),

    /// Every replica location failed during upload or download.
    #[error("no storage node reachable for key {0}")]
    StorageUnavailable(String),

    /// Malformed response line or HTTP reply.
    #[error("malformed response: {0}")]
    BadResponse(String),

    /// Rejected client construction options.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Transport failure mid-stream, surfaced to the caller's read/write.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn protocol(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Protocol {
            code: code.into(),
            message: message.into(),
        }
    }

    /// True for errors worth retrying against another tracker address.
    pub(crate) fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::BadResponse(_))
    }
}

impl From<Error> for std::io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
