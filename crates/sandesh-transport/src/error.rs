use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    #[error("not connected")]
    NotConnected,

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("TLS error: {reason}")]
    TlsError { reason: String },

    #[error("codec error: {0}")]
    CodecError(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
