use thiserror::Error;

/// Errors produced by the tunnel protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("multiplexer closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("local http error: {0}")]
    Http(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ciborium::de::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TunnelError::Transport(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
