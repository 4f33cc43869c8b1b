use std::io;

use thiserror::Error;

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, OS, etc.).
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Operation timed out.
    #[error("timeout waiting for response")]
    Timeout,

    /// A datagram could not be decoded as an RMCP/RMCP+ frame.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    /// Authentication or integrity verification failed.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    /// Cryptographic failure (invalid key sizes, etc.).
    #[error("crypto error: {0}")]
    Crypto(&'static str),

    /// Unsupported configuration or protocol feature.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// Invalid caller-supplied argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A hypervisor control operation failed.
    #[error("hypervisor operation failed: {0}")]
    Hypervisor(String),

    /// Invalid service configuration, detected before any instance serves.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An external address-management command failed.
    #[error("address management failed: {0}")]
    AddressManagement(String),
}

impl Error {
    pub(crate) fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn hypervisor(msg: impl Into<String>) -> Self {
        Self::Hypervisor(msg.into())
    }
}
