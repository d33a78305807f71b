//! Error types for MCP Tunnel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Why the remote side refused to perform a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Request body larger than the configured maximum
    TooLarge,
    /// Destination host not on the allow-list
    HostNotAllowed,
    /// Tenant exceeded its sliding-window budget
    RateLimited,
    /// Request could not be interpreted (bad body encoding, bad method)
    Malformed,
}

impl Rejection {
    /// HTTP status carried by the response for this rejection.
    pub fn status(self) -> u16 {
        match self {
            Rejection::TooLarge => 413,
            Rejection::HostNotAllowed => 403,
            Rejection::RateLimited => 429,
            Rejection::Malformed => 400,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::TooLarge => "too_large",
            Rejection::HostNotAllowed => "host_not_allowed",
            Rejection::RateLimited => "rate_limited",
            Rejection::Malformed => "malformed",
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {message}")]
    Validation { rejection: Rejection, message: String },

    #[error("Execution error: {0}")]
    Execution(String),

    /// The remote side answered with an `error` field set.
    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout")]
    Timeout,
}

impl Error {
    pub fn validation(rejection: Rejection, message: impl Into<String>) -> Self {
        Error::Validation {
            rejection,
            message: message.into(),
        }
    }

    /// HTTP status associated with this error, if it has one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Remote { status, .. } => Some(*status),
            Error::Validation { rejection, .. } => Some(rejection.status()),
            Error::Execution(_) => Some(502),
            _ => None,
        }
    }
}
