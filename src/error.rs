//! Crate-wide error taxonomy.
//!
//! Every fallible component returns a precise local error type; at the
//! boundary where a caller needs one unified type (protocol dispatch, the
//! sync loop, the CLI entry points) those convert into [`Error`] via `From`.
//! Lower layers are never forced to pay for variants they can't produce.

use thiserror::Error;

/// The seven error kinds named in the design: each corresponds to one
/// failure domain and carries a human-readable sub-kind.
#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<crate::crypto::CryptoError> for Error {
    fn from(e: crate::crypto::CryptoError) -> Self {
        Error::Integrity(e.to_string())
    }
}

impl From<crate::store::directory::DirectoryError> for Error {
    fn from(e: crate::store::directory::DirectoryError) -> Self {
        Error::Integrity(e.to_string())
    }
}

impl From<crate::file_object::FileObjectError> for Error {
    fn from(e: crate::file_object::FileObjectError) -> Self {
        Error::Integrity(e.to_string())
    }
}

impl From<crate::protocol::ProtocolError> for Error {
    fn from(e: crate::protocol::ProtocolError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<crate::server::context::ContextError> for Error {
    fn from(e: crate::server::context::ContextError) -> Self {
        Error::Protocol(e.to_string())
    }
}

impl From<crate::store::object_store::ObjectStoreError> for Error {
    fn from(e: crate::store::object_store::ObjectStoreError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<crate::server::housekeeping::HousekeepingError> for Error {
    fn from(e: crate::server::housekeeping::HousekeepingError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<crate::attr_block::AttrBlockError> for Error {
    fn from(e: crate::attr_block::AttrBlockError) -> Self {
        Error::Integrity(e.to_string())
    }
}

impl From<crate::client::sync::SyncError> for Error {
    fn from(e: crate::client::sync::SyncError) -> Self {
        match e {
            crate::client::sync::SyncError::Filesystem { .. } => Error::Filesystem(e.to_string()),
            crate::client::sync::SyncError::QuotaExceeded => Error::Storage(e.to_string()),
            crate::client::sync::SyncError::Server(_) => Error::Connection(e.to_string()),
        }
    }
}

impl From<crate::client::control_socket::ControlSocketError> for Error {
    fn from(e: crate::client::control_socket::ControlSocketError) -> Self {
        Error::Connection(e.to_string())
    }
}
