//! Error types shared by every component of the client.

use reqwest::StatusCode;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Common result alias for the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// No node is connected and ready to take the operation.
    #[error("no available nodes")]
    NoAvailableNodes,

    /// A session-scoped REST call was issued before the node sent `ready`.
    #[error("session not available on node {node}")]
    SessionUnavailable { node: String },

    /// The node answered a REST call with a non-2xx status.
    #[error("node rejected request ({status}): {message}")]
    Rest { status: StatusCode, message: String },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("no player for guild {0}")]
    PlayerNotFound(String),

    /// `play` was called with nothing to play.
    #[error("no track to play")]
    NoTrack,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),

    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] tungstenite::http::header::InvalidHeaderValue),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tungstenite::Error> for Error {
    fn from(error: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(error))
    }
}

impl Error {
    /// Whether the failure came from the node refusing a command, as opposed
    /// to a transport fault.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rest { .. })
    }
}
