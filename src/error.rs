//! Error type shared by the DHT core, the transports and the RPC layer.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DhtError>;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("value not found")]
    NotFound,

    #[error("unknown method {0}")]
    UnknownMethod(String),

    #[error("handler for method {0} already registered")]
    DuplicateHandler(String),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel closed")]
    ChannelClosed,

    #[error("{0} is not implemented")]
    NotImplemented(&'static str),
}

impl DhtError {
    /// True for failures that mean the peer could not be reached or did not
    /// answer in time, as opposed to local or protocol errors.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            DhtError::Connection(_) | DhtError::Timeout | DhtError::ChannelClosed
        )
    }
}
