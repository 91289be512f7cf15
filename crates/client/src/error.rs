use std::time::Duration;

/// Errors surfaced by the public client API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket or negotiation failure while establishing a session.
    #[error("connection failed: {0}")]
    Connection(String),
    /// A frame could not be parsed. Only surfaced where a caller is waiting on it.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A correlated request or setup step exceeded its deadline.
    #[error("{what} timed out after {}s", .after.as_secs())]
    Timeout { what: &'static str, after: Duration },
    /// The remote side reported failure for a correlated request.
    #[error("remote error: {0}")]
    Remote(String),
    /// Operation requires a Ready session.
    #[error("session is not connected")]
    NotConnected,
    /// Operation is unsupported on this host or with this configuration.
    #[error("unsupported environment: {0}")]
    Environment(String),
    /// The session or channel closed while the operation was pending.
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("tunnel error: {0}")]
    Tunnel(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<droidlink_protocol::MessageError> for Error {
    fn from(e: droidlink_protocol::MessageError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Connection(e.to_string())
    }
}
