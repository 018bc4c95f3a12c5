//! DSM buffer: the local segment of a server rank plus the client and
//! server halves of the command protocol.
//!
//! # Roles
//!
//! - **Server**: owns a [`segment::Segment`] and runs the service loop.
//! - **Worker**: a client rank inside the same group as the servers.
//! - **Remote**: a client rank of a peer group reached over the merged
//!   channel of its [`ProcessGroup`].
//!
//! # States
//!
//! ```text
//! Unconfigured -> Created -> Servicing -> Terminated   (server)
//!                         -> Idle -> Disconnected       (client)
//! ```
//!
//! Named locks, notifications and the file registry live on the start
//! server. Other servers forward lock and notify traffic they receive to it.

mod client;
mod segment;
mod service;
mod tables;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use client::{split_range, Piece};
pub use service::ServiceStep;
pub use tables::{FileRegistry, LockTable, NotifyTable, Release, Requester, Route};

use crate::comm::{Communicator, ProcessGroup, Rank};
use crate::error::{DsmError, DsmResult};
use crate::layout::AddressMap;
use segment::Segment;

/// What this rank does for the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Worker,
    Remote,
}

/// Lifecycle of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Unconfigured,
    Created,
    Servicing,
    Idle,
    Disconnected,
    Terminated,
}

/// Distributed shared memory buffer of one rank
#[derive(Debug)]
pub struct DsmBuffer {
    group: ProcessGroup,
    map: Option<AddressMap>,
    segment: Option<Segment>,
    role: Role,
    state: BufferState,
    locks: LockTable,
    notify: NotifyTable,
    files: Option<FileRegistry>,
    /// Peer processes admitted on the current merged channel
    expected_peers: usize,
    departed: usize,
    /// Re-admit the same number of peers after the last one leaves
    reaccept: bool,
    shutdown: Option<Arc<AtomicBool>>,
}

impl DsmBuffer {
    /// An unconfigured buffer over an initialized process group
    pub fn new(group: ProcessGroup) -> Self {
        Self {
            group,
            map: None,
            segment: None,
            role: Role::Worker,
            state: BufferState::Unconfigured,
            locks: LockTable::default(),
            notify: NotifyTable::default(),
            files: None,
            expected_peers: 0,
            departed: 0,
            reaccept: false,
            shutdown: None,
        }
    }

    /// Adopt `map` for the local group
    ///
    /// Ranks inside the map's server range become servers and allocate
    /// their segment; every other rank becomes a worker.
    pub fn configure(&mut self, map: AddressMap) -> DsmResult<()> {
        self.ensure_unconfigured()?;
        let rank = self.group.local_rank()?;
        let size = self.group.local_size()?;
        if map.end_server() >= size {
            return Err(DsmError::Configuration(format!(
                "server range {}..={} does not fit a group of {}",
                map.start_server(),
                map.end_server(),
                size
            )));
        }

        if map.is_server(rank) {
            let length = map.segment_length(rank);
            self.segment = Some(Segment::new(length));
            self.role = Role::Server;
            if rank == map.start_server() {
                self.files = Some(FileRegistry::new(map.total_length(), map.block_length()));
            }
            tracing::info!(
                "Rank {} serves {} bytes of a {:?} buffer of {} bytes",
                rank,
                length,
                map.dsm_type(),
                map.total_length()
            );
        } else {
            self.role = Role::Worker;
            tracing::debug!("Rank {} is a worker", rank);
        }
        self.map = Some(map);
        self.state = BufferState::Created;
        Ok(())
    }

    /// Adopt `map` as a client of the group reached through the peer channel
    pub fn configure_remote(&mut self, map: AddressMap) -> DsmResult<()> {
        self.ensure_unconfigured()?;
        let channel = self.group.remote().ok_or_else(|| {
            DsmError::InvalidState("remote configuration needs a connected channel".to_string())
        })?;
        if map.end_server() >= channel.size() || map.is_server(channel.rank()) {
            return Err(DsmError::Configuration(format!(
                "server range {}..={} does not match merged rank {}/{}",
                map.start_server(),
                map.end_server(),
                channel.rank(),
                channel.size()
            )));
        }
        self.role = Role::Remote;
        self.map = Some(map);
        self.state = BufferState::Created;
        Ok(())
    }

    fn ensure_unconfigured(&self) -> DsmResult<()> {
        if self.state != BufferState::Unconfigured {
            return Err(DsmError::InvalidState(format!(
                "buffer already configured ({:?})",
                self.state
            )));
        }
        Ok(())
    }

    pub fn group(&self) -> &ProcessGroup {
        &self.group
    }

    pub fn group_mut(&mut self) -> &mut ProcessGroup {
        &mut self.group
    }

    pub fn map(&self) -> DsmResult<&AddressMap> {
        self.map
            .as_ref()
            .ok_or_else(|| DsmError::InvalidState("buffer is not configured".to_string()))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn is_server(&self) -> bool {
        self.role == Role::Server
    }

    /// Whether this rank owns the lock table and file registry
    pub fn is_start_server(&self) -> bool {
        self.files.is_some()
    }

    /// Total size of the shared address space
    pub fn total_length(&self) -> DsmResult<u64> {
        Ok(self.map()?.total_length())
    }

    /// Bytes of local segment, 0 off servers
    pub fn segment_length(&self) -> u64 {
        self.segment.as_ref().map_or(0, Segment::len)
    }

    /// Re-admit peers after the last one disconnects (published groups)
    pub fn set_reaccept(&mut self, reaccept: bool) {
        self.reaccept = reaccept;
    }

    /// Leave the service loop once `flag` is raised
    pub fn set_shutdown_flag(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown = Some(flag);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|f| f.load(Ordering::Relaxed))
    }

    /// Allow a terminated server to enter the service loop again
    pub fn restart(&mut self) -> DsmResult<()> {
        if self.state != BufferState::Terminated || self.segment.is_none() {
            return Err(DsmError::InvalidState(format!(
                "cannot restart a buffer in state {:?}",
                self.state
            )));
        }
        self.state = BufferState::Created;
        Ok(())
    }

    /// Release the local segment
    pub fn release(&mut self) {
        if let Some(segment) = self.segment.take() {
            tracing::debug!("Released segment of {} bytes", segment.len());
        }
        self.state = BufferState::Terminated;
    }

    /// The route clients of this rank use to reach servers
    pub(crate) fn client_route(&self) -> Route {
        match self.role {
            Role::Remote => Route::Remote,
            Role::Server | Role::Worker => Route::Local,
        }
    }

    /// This rank's server index, if it serves
    pub(crate) fn own_server_rank(&self) -> Option<Rank> {
        match self.role {
            Role::Server => self.group.local_rank().ok(),
            _ => None,
        }
    }
}

/// The communicator behind `route`
pub(crate) fn channel(group: &ProcessGroup, route: Route) -> DsmResult<&Communicator> {
    match route {
        Route::Local => Ok(group.local()?),
        Route::Remote => group
            .remote()
            .ok_or_else(|| DsmError::InvalidState("no peer channel".to_string())),
    }
}
