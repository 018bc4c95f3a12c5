//! Per-rank receive queue with (context, source, tag) matching.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::{CommError, CommResult, Rank, Source, Tag, TagFilter};

/// A message as it travels between wires
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub context: u64,
    pub source: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

/// A received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl From<Frame> for Envelope {
    fn from(frame: Frame) -> Self {
        Self {
            source: frame.source,
            tag: frame.tag,
            payload: frame.payload,
        }
    }
}

#[derive(Debug, Default)]
struct MailboxState {
    frames: VecDeque<Frame>,
    closed: bool,
}

/// How long a receive may block
#[derive(Debug, Clone, Copy)]
pub(crate) enum Wait {
    No,
    Until(Instant),
    Forever,
}

impl Wait {
    pub fn timeout(duration: Duration) -> Self {
        Wait::Until(Instant::now() + duration)
    }
}

#[derive(Debug, Default)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a frame; fails once the mailbox is closed
    pub fn push(&self, frame: Frame) -> CommResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(CommError::Closed);
        }
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_all();
        Ok(())
    }

    /// Remove the oldest frame matching the selectors
    ///
    /// Returns `Ok(None)` when nothing matched before the wait expired.
    /// A closed mailbox still hands out frames queued before the close.
    pub fn take(
        &self,
        context: u64,
        source: Source,
        tag: TagFilter,
        wait: Wait,
    ) -> CommResult<Option<Frame>> {
        let mut state = self.lock();
        loop {
            let hit = state
                .frames
                .iter()
                .position(|f| f.context == context && source.matches(f.source) && tag.matches(f.tag));
            if let Some(index) = hit {
                return Ok(state.frames.remove(index));
            }
            if state.closed {
                return Err(CommError::Closed);
            }

            state = match wait {
                Wait::No => return Ok(None),
                Wait::Forever => self.ready.wait(state).unwrap_or_else(PoisonError::into_inner),
                Wait::Until(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Stop accepting frames and wake every blocked receiver
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }
}
