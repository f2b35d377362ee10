use std::time::Duration;

use thiserror::Error;

/// Failure observed while driving one generation stream.
///
/// A stream that closes after at least one token without a terminal marker
/// is not represented here: the adapter turns it into an implicit `Done`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Refused, reset, DNS failure or a transport error mid-body.
    #[error("connection error: {0}")]
    Connection(String),

    /// The service answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// No data arrived within the configured window.
    #[error("no data received within {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// The payload could not be interpreted at all.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The transport closed without a single token or error.
    #[error("empty stream")]
    EmptyStream,

    /// The user interrupted the session.
    #[error("cancelled by user")]
    Cancelled,
}

impl StreamError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout(_))
    }

    pub(crate) fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            StreamError::Protocol(err.to_string())
        } else {
            StreamError::Connection(err.to_string())
        }
    }
}
