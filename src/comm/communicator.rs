//! Blocking point-to-point communicator

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::mailbox::{Frame, Mailbox, Wait};
use super::{CommError, CommResult, Envelope, Rank, Source, Tag, TagFilter};
use crate::constants::tags;

/// Moves frames between the ranks of one group
pub(crate) trait Wire: Send + Sync + fmt::Debug {
    fn rank(&self) -> Rank;
    fn size(&self) -> usize;

    /// Deliver a frame to `dest`'s mailbox
    fn transmit(&self, dest: Rank, frame: Frame) -> CommResult<()>;

    /// This rank's receive queue
    fn mailbox(&self) -> &Mailbox;

    /// Whether `dest` can be reached at all over this wire
    fn reaches(&self, dest: Rank) -> bool;
}

/// A communication handle: a wire plus a private context
///
/// Frames sent on one context are never matched by receives on another, so a
/// duplicate can be handed to a library without its traffic leaking into the
/// caller's. Dropping the last handle of a wire releases it.
pub struct Communicator {
    wire: Arc<dyn Wire>,
    context: u64,
    duplicates: AtomicU64,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .field("context", &format_args!("{:#x}", self.context))
            .finish()
    }
}

impl Communicator {
    pub(crate) fn from_wire(wire: Arc<dyn Wire>) -> Self {
        Self {
            wire,
            context: 0,
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn rank(&self) -> Rank {
        self.wire.rank()
    }

    pub fn size(&self) -> usize {
        self.wire.size()
    }

    /// Whether `dest` has a route on this communicator
    pub fn reaches(&self, dest: Rank) -> bool {
        dest < self.size() && self.wire.reaches(dest)
    }

    /// Send `payload` to `dest` on `tag`
    ///
    /// Sends are buffered by the receiver's mailbox and return once the frame
    /// has been handed to the wire.
    pub fn send(&self, dest: Rank, tag: Tag, payload: &[u8]) -> CommResult<()> {
        if dest >= self.size() {
            return Err(CommError::InvalidRank {
                rank: dest,
                size: self.size(),
            });
        }
        let frame = Frame {
            context: self.context,
            source: self.rank(),
            tag,
            payload: payload.to_vec(),
        };
        self.wire.transmit(dest, frame)
    }

    /// Block until a matching message arrives
    pub fn recv(&self, source: Source, tag: TagFilter) -> CommResult<Envelope> {
        self.wire
            .mailbox()
            .take(self.context, source, tag, Wait::Forever)?
            .map(Envelope::from)
            .ok_or(CommError::Closed)
    }

    /// Take a matching message if one is already queued
    pub fn try_recv(&self, source: Source, tag: TagFilter) -> CommResult<Option<Envelope>> {
        Ok(self
            .wire
            .mailbox()
            .take(self.context, source, tag, Wait::No)?
            .map(Envelope::from))
    }

    /// Block for at most `timeout`
    pub fn recv_timeout(
        &self,
        source: Source,
        tag: TagFilter,
        timeout: Duration,
    ) -> CommResult<Option<Envelope>> {
        Ok(self
            .wire
            .mailbox()
            .take(self.context, source, tag, Wait::timeout(timeout))?
            .map(Envelope::from))
    }

    /// Receive exactly `len` bytes from `source` on `tag`
    pub fn recv_exact(&self, source: Rank, tag: Tag, len: usize) -> CommResult<Vec<u8>> {
        let envelope = self.recv(Source::Rank(source), TagFilter::Only(tag))?;
        if envelope.payload.len() != len {
            return Err(CommError::LengthMismatch {
                rank: source,
                tag,
                expected: len,
                actual: envelope.payload.len(),
            });
        }
        Ok(envelope.payload)
    }

    /// Take a private duplicate of this handle
    ///
    /// Collective: every rank of the group must duplicate the same parent in
    /// the same order, as the child context is derived from the parent's
    /// context and its duplicate count.
    pub fn duplicate(&self) -> CommResult<Communicator> {
        if self.wire.mailbox().is_closed() {
            return Err(CommError::Duplicate(format!(
                "wire of rank {} is already released",
                self.rank()
            )));
        }
        let ordinal = self.duplicates.fetch_add(1, Ordering::Relaxed) + 1;
        let context = derive_context(self.context, ordinal);
        tracing::trace!(
            "Duplicated communicator (rank {}, context {:#x} -> {:#x})",
            self.rank(),
            self.context,
            context
        );
        Ok(Self {
            wire: self.wire.clone(),
            context,
            duplicates: AtomicU64::new(0),
        })
    }

    /// Synchronize the listed ranks
    ///
    /// The first rank in `members` collects one message from every other
    /// member and then releases them. Ranks outside `members` are untouched,
    /// so this works while server ranks sit in their service loop.
    pub fn barrier_among(&self, members: &[Rank]) -> CommResult<()> {
        let me = self.rank();
        let Some(&root) = members.first() else {
            return Ok(());
        };
        if !members.contains(&me) {
            return Err(CommError::InvalidRank {
                rank: me,
                size: members.len(),
            });
        }

        if me == root {
            for &member in &members[1..] {
                self.recv(Source::Rank(member), TagFilter::Only(tags::BARRIER))?;
            }
            for &member in &members[1..] {
                self.send(member, tags::BARRIER, &[])?;
            }
        } else {
            self.send(root, tags::BARRIER, &[])?;
            self.recv(Source::Rank(root), TagFilter::Only(tags::BARRIER))?;
        }
        Ok(())
    }
}

fn derive_context(parent: u64, ordinal: u64) -> u64 {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&parent.to_le_bytes());
    bytes[8..].copy_from_slice(&ordinal.to_le_bytes());
    // context 0 is reserved for the root handle
    xxhash_rust::xxh3::xxh3_64(&bytes) | 1
}
