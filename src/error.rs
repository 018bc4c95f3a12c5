//! Crate-wide error type

use crate::comm::CommError;
use crate::config::ConfigError;
use crate::layout::LayoutError;
use crate::protocol::ProtocolError;

/// DSM errors
#[derive(Debug, thiserror::Error)]
pub enum DsmError {
    /// Ranks disagree on the buffer layout, or the layout is invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Communication error: {0}")]
    Comm(#[from] CommError),

    /// A channel handle could not be duplicated or released
    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Range [{address}, {address}+{length}) exceeds buffer length {total}")]
    OutOfRange { address: u64, length: u64, total: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No space: {0}")]
    NoSpace(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl DsmError {
    /// Whether the error leaves the shared address space untrustworthy
    ///
    /// Fatal errors end the offending rank's service loop. Connection
    /// failures, lookups and client-side range checks are reported to the
    /// caller instead.
    pub fn is_fatal(&self) -> bool {
        match self {
            DsmError::Configuration(_)
            | DsmError::Protocol(_)
            | DsmError::Resource(_)
            | DsmError::Config(_) => true,
            DsmError::Comm(e) => !e.is_connection_failure(),
            DsmError::InvalidState(_)
            | DsmError::OutOfRange { .. }
            | DsmError::NotFound(_)
            | DsmError::NoSpace(_) => false,
        }
    }
}

impl From<LayoutError> for DsmError {
    fn from(e: LayoutError) -> Self {
        DsmError::Configuration(e.to_string())
    }
}

pub type DsmResult<T> = Result<T, DsmError>;
