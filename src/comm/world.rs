//! MPI world of a launched server job
//!
//! `mpirun` starts one process per server rank. [`MpiWorld`] initializes MPI,
//! reports this process's rank and size, synchronizes the job with
//! `MPI_Barrier` and hands out one [`Communicator`] whose frames travel as
//! MPI messages. A pump thread polls for incoming frames and files them in
//! the rank's mailbox, so receives keep their (context, source, tag)
//! matching.
//!
//! Drop the communicator (and everything built on it) before the world:
//! dropping the world stops the pump and finalizes MPI.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::traits::{Communicator as _, Source as _};
use mpi::Threading;
use zerocopy::{FromBytes, IntoBytes};

use super::communicator::{Communicator, Wire};
use super::mailbox::{Frame, Mailbox};
use super::tcp::FrameHeader;
use super::{CommError, CommResult, Rank};

/// MPI tag carrying every frame
const FRAME_TAG: mpi::Tag = 0x4453;

/// Pump sleep when no frame is pending
const PUMP_IDLE: Duration = Duration::from_micros(100);

/// The world communicator shared by the pump and the wire
struct MpiLink {
    world: SimpleCommunicator,
}

// SAFETY: MPI is initialized with `Threading::Multiple` before a link exists,
// which allows concurrent calls on one communicator from any thread.
unsafe impl Send for MpiLink {}
unsafe impl Sync for MpiLink {}

/// An initialized MPI job
pub struct MpiWorld {
    link: Arc<MpiLink>,
    rank: Rank,
    size: usize,
    mailbox: Arc<Mailbox>,
    stop: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
    taken: AtomicBool,
    // finalizes MPI when dropped, after `Drop::drop` joined the pump
    _universe: Universe,
}

impl MpiWorld {
    /// Initialize MPI with full thread support and start the frame pump
    pub fn initialize() -> CommResult<Self> {
        let (universe, threading) = mpi::initialize_with_threading(Threading::Multiple)
            .ok_or_else(|| CommError::Mpi("MPI is already initialized".to_string()))?;
        if threading != Threading::Multiple {
            return Err(CommError::Mpi(
                "MPI library does not allow calls from several threads".to_string(),
            ));
        }

        let world = universe.world();
        let rank = world.rank() as Rank;
        let size = world.size() as usize;
        let link = Arc::new(MpiLink { world });
        let mailbox = Arc::new(Mailbox::new());
        let stop = Arc::new(AtomicBool::new(false));

        let pump = {
            let link = link.clone();
            let mailbox = mailbox.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name(format!("dsm-mpi-pump-{}", rank))
                .spawn(move || run_pump(&link, &mailbox, &stop))?
        };

        tracing::debug!("MPI world initialized: rank {}/{}", rank, size);
        Ok(Self {
            link,
            rank,
            size,
            mailbox,
            stop,
            pump: Some(pump),
            taken: AtomicBool::new(false),
            _universe: universe,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Block until every process of the job arrives
    pub fn barrier(&self) {
        self.link.world.barrier();
    }

    /// The communicator over the whole job; available once
    pub fn communicator(&self) -> CommResult<Communicator> {
        if self.taken.swap(true, Ordering::AcqRel) {
            return Err(CommError::Duplicate(
                "the world communicator was already handed out".to_string(),
            ));
        }
        let wire: Arc<dyn Wire> = Arc::new(MpiWire {
            link: self.link.clone(),
            rank: self.rank,
            size: self.size,
            mailbox: self.mailbox.clone(),
        });
        Ok(Communicator::from_wire(wire))
    }
}

impl Drop for MpiWorld {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        tracing::debug!("Rank {} leaving the MPI world", self.rank);
    }
}

fn run_pump(link: &MpiLink, mailbox: &Mailbox, stop: &AtomicBool) {
    while !stop.load(Ordering::Acquire) {
        let Some((message, _)) = link
            .world
            .any_process()
            .immediate_matched_probe_with_tag(FRAME_TAG)
        else {
            thread::sleep(PUMP_IDLE);
            continue;
        };
        let (bytes, status) = message.matched_receive_vec::<u8>();
        let source = status.source_rank() as Rank;
        match decode_frame(&bytes, source) {
            // a closed mailbox means the communicator is gone; drop the frame
            Some(frame) => {
                if mailbox.push(frame).is_err() {
                    tracing::trace!("Dropped frame from rank {} after release", source);
                }
            }
            None => tracing::warn!(
                "Discarded malformed frame of {} bytes from rank {}",
                bytes.len(),
                source
            ),
        }
    }
}

fn encode_frame(frame: &Frame) -> Vec<u8> {
    let header = FrameHeader {
        context: frame.context,
        length: frame.payload.len() as u64,
        source: frame.source as u32,
        tag: frame.tag,
    };
    let mut bytes = Vec::with_capacity(std::mem::size_of::<FrameHeader>() + frame.payload.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&frame.payload);
    bytes
}

/// Frame from an MPI message; the source comes from the MPI status
fn decode_frame(bytes: &[u8], source: Rank) -> Option<Frame> {
    let (header, payload) = FrameHeader::read_from_prefix(bytes).ok()?;
    if header.length != payload.len() as u64 {
        return None;
    }
    Some(Frame {
        context: header.context,
        source,
        tag: header.tag,
        payload: payload.to_vec(),
    })
}

struct MpiWire {
    link: Arc<MpiLink>,
    rank: Rank,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl fmt::Debug for MpiWire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpiWire")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Wire for MpiWire {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn transmit(&self, dest: Rank, frame: Frame) -> CommResult<()> {
        if dest == self.rank {
            return self.mailbox.push(frame);
        }
        let bytes = encode_frame(&frame);
        self.link
            .world
            .process_at_rank(dest as mpi::Rank)
            .send_with_tag(&bytes[..], FRAME_TAG);
        Ok(())
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn reaches(&self, dest: Rank) -> bool {
        dest < self.size
    }
}

impl Drop for MpiWire {
    fn drop(&mut self) {
        self.mailbox.close();
    }
}
