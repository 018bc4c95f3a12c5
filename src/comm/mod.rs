//! Process group descriptor and the transports underneath it.
//!
//! ```text
//!   ProcessGroup
//!   ├── local:   Communicator ──┐
//!   └── channel: ChannelState   │   Communicator = Arc<dyn Wire> + context
//!        Unbound                │
//!        Listening{listener}    ├── LocalWire  (threads in one process)
//!        Connected{Communicator}├── TcpWire    (one socket per peer, reader threads)
//!                               └── MpiWire    (MPI job launched by mpirun)
//! ```
//!
//! Every wire delivers frames into a per-rank [`mailbox::Mailbox`]. Receivers
//! match on (context, source, tag) and take the oldest matching frame, which
//! gives per-sender FIFO ordering on every tag.

pub mod communicator;
pub mod group;
pub mod local;
pub mod mailbox;
pub mod rendezvous;
pub mod tcp;
#[cfg(feature = "mpi")]
pub mod world;

pub use communicator::Communicator;
pub use group::{ChannelKind, ChannelState, ProcessGroup};
pub use local::LocalFabric;
pub use mailbox::Envelope;
pub use rendezvous::RendezvousFile;
pub use tcp::TcpWire;
#[cfg(feature = "mpi")]
pub use world::MpiWorld;

/// Index of a participant within a communicator
pub type Rank = usize;

/// Channel tag, see [`crate::constants::tags`]
pub type Tag = i32;

/// Sender selection for a receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Any,
    Rank(Rank),
}

impl Source {
    pub(crate) fn matches(&self, rank: Rank) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(r) => *r == rank,
        }
    }
}

/// Tag selection for a receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagFilter {
    Any,
    Only(Tag),
}

impl TagFilter {
    pub(crate) fn matches(&self, tag: Tag) -> bool {
        match self {
            TagFilter::Any => true,
            TagFilter::Only(t) => *t == tag,
        }
    }
}

/// Communication errors
#[derive(Debug, thiserror::Error)]
pub enum CommError {
    #[error("No local group bound")]
    Unbound,

    #[error("Rank {rank} out of range for group of size {size}")]
    InvalidRank { rank: Rank, size: usize },

    #[error("Rank {0} is not reachable on this channel")]
    Unreachable(Rank),

    #[error("Channel closed")]
    Closed,

    #[error("Channel is not listening")]
    NotListening,

    #[error("Rendezvous error: {0}")]
    Rendezvous(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Expected {expected} bytes from rank {rank} on tag {tag:#x}, got {actual}")]
    LengthMismatch {
        rank: Rank,
        tag: Tag,
        expected: usize,
        actual: usize,
    },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Communicator duplication failed: {0}")]
    Duplicate(String),

    #[error("MPI error: {0}")]
    Mpi(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommError {
    /// Connection-class failures a caller may retry
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            CommError::Rendezvous(_)
                | CommError::Handshake(_)
                | CommError::Timeout(_)
                | CommError::NotListening
                | CommError::Io(_)
        )
    }
}

pub type CommResult<T> = Result<T, CommError>;
