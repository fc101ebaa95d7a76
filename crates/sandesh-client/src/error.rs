use thiserror::Error;

use sandesh_transport::error::TransportError;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("UVE type {0} already registered")]
    DuplicateUveType(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
