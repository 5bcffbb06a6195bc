use thiserror::Error;

#[derive(Debug, Error)]
pub enum DhtError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid node id length")]
    InvalidNodeId,

    #[error("rate limited")]
    RateLimited,

    #[error("dht engine has shut down")]
    Shutdown,
}
