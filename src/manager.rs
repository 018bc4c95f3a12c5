//! DSM manager: assembles a [`DsmBuffer`] from a configuration and a
//! communicator, and tears it down again.
//!
//! Three assembly modes:
//!
//! - [`DsmManager::create`]: one group split into servers and workers.
//!   Servers serve until DONE before `create` returns; workers return at
//!   once with a client buffer.
//! - [`DsmManager::publish`]: a group of servers publishes its channel and
//!   serves independently launched client groups.
//! - [`DsmManager::attach`]: a client group joins a published server group.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::buffer::{BufferState, DsmBuffer, Role, Route};
use crate::comm::{Communicator, ProcessGroup, Rank, RendezvousFile};
use crate::config::DsmConfig;
use crate::error::{DsmError, DsmResult};
use crate::layout::AddressMap;

/// How the buffer was assembled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Partitioned,
    Published,
    Attached,
}

/// Owner of one rank's buffer
#[derive(Debug)]
pub struct DsmManager {
    buffer: DsmBuffer,
    mode: Mode,
    shutdown_on_detach: bool,
    destroyed: bool,
}

fn bind_group(comm: &Communicator, config: &DsmConfig) -> DsmResult<ProcessGroup> {
    let rendezvous = RendezvousFile::new(config.network.rendezvous_file.clone());
    let group = ProcessGroup::bind(comm, rendezvous)?
        .with_bind_host(config.network.bind_host.clone());
    Ok(group)
}

impl DsmManager {
    /// Partition `comm` into servers and workers and agree on the layout
    ///
    /// Server ranks run the service loop before this returns.
    pub fn create(comm: &Communicator, config: &DsmConfig) -> DsmResult<Self> {
        Self::create_with_shutdown(comm, config, None)
    }

    pub fn create_with_shutdown(
        comm: &Communicator,
        config: &DsmConfig,
        shutdown: Option<Arc<AtomicBool>>,
    ) -> DsmResult<Self> {
        config.validate()?;
        let group = bind_group(comm, config)?;
        let map = config.buffer.layout_spec().build(comm.size())?;

        let mut buffer = DsmBuffer::new(group);
        if let Some(flag) = shutdown {
            buffer.set_shutdown_flag(flag);
        }
        buffer.configure(map.clone())?;

        if buffer.is_start_server() {
            buffer.send_info(Route::Local)?;
        } else if !buffer.is_server() {
            let (info, table) = buffer.receive_info(Route::Local)?;
            if (info, table) != map.to_info() {
                return Err(DsmError::Configuration(format!(
                    "rank {} disagrees with the start server on the buffer layout",
                    comm.rank()
                )));
            }
        }

        let mut manager = Self {
            buffer,
            mode: Mode::Partitioned,
            shutdown_on_detach: true,
            destroyed: false,
        };
        if manager.buffer.is_server() {
            manager.buffer.service_loop()?;
        }
        Ok(manager)
    }

    /// Serve clients of other jobs until one of them sends DONE
    ///
    /// Every rank of `comm` must be a server. The start server admits
    /// `network.num_connections` client processes at a time and re-admits
    /// after they all disconnect.
    pub fn publish(
        comm: &Communicator,
        config: &DsmConfig,
        shutdown: Option<Arc<AtomicBool>>,
    ) -> DsmResult<Self> {
        config.validate()?;
        let group = bind_group(comm, config)?;
        let map = config.buffer.layout_spec().build(comm.size())?;
        if map.servers() != (0..comm.size()) {
            return Err(DsmError::Configuration(format!(
                "a published group must consist of servers only, got {}..={} of {}",
                map.start_server(),
                map.end_server(),
                comm.size()
            )));
        }

        let mut buffer = DsmBuffer::new(group);
        if let Some(flag) = shutdown {
            buffer.set_shutdown_flag(flag);
        }
        buffer.configure(map)?;
        buffer.set_reaccept(true);
        buffer.group_mut().open_channel()?;

        if buffer.is_start_server() {
            buffer.send_accept(config.network.num_connections)?;
        }
        let served = buffer.service_loop();
        let closed = buffer.group_mut().close_channel();
        served?;
        closed?;

        Ok(Self {
            buffer,
            mode: Mode::Published,
            shutdown_on_detach: config.network.shutdown_on_detach,
            destroyed: false,
        })
    }

    /// Join the server group published at `network.rendezvous_file`
    ///
    /// Polls every `connect_retry_ms` for at most `connect_timeout_secs`.
    /// Collective over `comm`.
    pub fn attach(comm: &Communicator, config: &DsmConfig) -> DsmResult<Self> {
        config.validate()?;
        let mut group = bind_group(comm, config)?;

        let deadline = Instant::now() + config.network.connect_timeout();
        let mut attempts = 0u32;
        while !group.connect()? {
            attempts += 1;
            if Instant::now() >= deadline {
                return Err(DsmError::Comm(crate::comm::CommError::Timeout(format!(
                    "server group at {:?} after {} attempts",
                    group.rendezvous().path(),
                    attempts
                ))));
            }
            thread::sleep(config.network.connect_retry());
        }

        let mut buffer = DsmBuffer::new(group);
        let (info, table) = buffer.receive_info(Route::Remote)?;
        let map = AddressMap::from_info(&info, &table)?;
        tracing::info!(
            "Attached to a {:?} buffer of {} bytes on servers {:?}",
            map.dsm_type(),
            map.total_length(),
            map.servers()
        );
        buffer.configure_remote(map)?;

        Ok(Self {
            buffer,
            mode: Mode::Attached,
            shutdown_on_detach: config.network.shutdown_on_detach,
            destroyed: false,
        })
    }

    pub fn buffer(&self) -> &DsmBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut DsmBuffer {
        &mut self.buffer
    }

    /// Hand the buffer to a long-lived owner such as the file adapter
    pub fn into_buffer(mut self) -> DsmBuffer {
        self.destroyed = true;
        let group = ProcessGroup::new(self.buffer.group().rendezvous().clone());
        std::mem::replace(&mut self.buffer, DsmBuffer::new(group))
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether detaching stops the servers
    pub fn set_shutdown_on_detach(&mut self, shutdown: bool) {
        self.shutdown_on_detach = shutdown;
    }

    /// Tear the buffer down
    ///
    /// Collective over the clients of the local group: they synchronize,
    /// then the lead client stops the servers (attached clients only when
    /// `shutdown_on_detach` is set, the others disconnect). Servers release
    /// their segment.
    pub fn destroy(&mut self) -> DsmResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        destroy_buffer(&mut self.buffer, self.mode, self.shutdown_on_detach)
    }
}

pub(crate) fn destroy_buffer(
    buffer: &mut DsmBuffer,
    mode: Mode,
    shutdown_on_detach: bool,
) -> DsmResult<()> {
    match buffer.role() {
        Role::Server => {
            buffer.release();
            Ok(())
        }
        Role::Worker => {
            let workers = worker_ranks(buffer)?;
            let local = buffer.group().local()?;
            local.barrier_among(&workers)?;
            if workers.first() == Some(&local.rank()) {
                buffer.send_done()?;
            }
            buffer.release();
            Ok(())
        }
        Role::Remote => {
            if buffer.state() == BufferState::Disconnected {
                return Ok(());
            }
            let local = buffer.group().local()?;
            let all: Vec<Rank> = (0..local.size()).collect();
            let lead_stops = shutdown_on_detach && local.rank() == 0;
            // Disconnects land before DONE so no server re-admits
            if !lead_stops {
                buffer.send_disconnect()?;
            }
            buffer.group().local()?.barrier_among(&all)?;
            if lead_stops {
                buffer.send_done()?;
                buffer.detach();
            }
            tracing::debug!("Left a {:?} buffer", mode);
            Ok(())
        }
    }
}

fn worker_ranks(buffer: &DsmBuffer) -> DsmResult<Vec<Rank>> {
    let map = buffer.map()?;
    let size = buffer.group().local_size()?;
    Ok((0..size).filter(|r| !map.is_server(*r)).collect())
}

impl Drop for DsmManager {
    fn drop(&mut self) {
        if !self.destroyed {
            if let Err(e) = self.destroy() {
                tracing::warn!("Destroying DSM buffer on drop failed: {}", e);
            }
        }
    }
}
