//! In-process wire: every rank is a thread of the current process.

use std::sync::Arc;

use super::communicator::{Communicator, Wire};
use super::mailbox::{Frame, Mailbox};
use super::{CommError, CommResult, Rank};

/// Factory for groups of in-process communicators
pub struct LocalFabric;

impl LocalFabric {
    /// Create a group of `size` communicators, one per rank
    ///
    /// Hand each communicator to the thread playing that rank.
    pub fn create(size: usize) -> Vec<Communicator> {
        let mailboxes: Arc<Vec<Arc<Mailbox>>> =
            Arc::new((0..size).map(|_| Arc::new(Mailbox::new())).collect());

        (0..size)
            .map(|rank| {
                let wire: Arc<dyn Wire> = Arc::new(LocalWire {
                    rank,
                    mailboxes: mailboxes.clone(),
                });
                Communicator::from_wire(wire)
            })
            .collect()
    }
}

#[derive(Debug)]
struct LocalWire {
    rank: Rank,
    mailboxes: Arc<Vec<Arc<Mailbox>>>,
}

impl Wire for LocalWire {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn transmit(&self, dest: Rank, frame: Frame) -> CommResult<()> {
        let mailbox = self.mailboxes.get(dest).ok_or(CommError::InvalidRank {
            rank: dest,
            size: self.mailboxes.len(),
        })?;
        mailbox.push(frame)
    }

    fn mailbox(&self) -> &Mailbox {
        &self.mailboxes[self.rank]
    }

    fn reaches(&self, dest: Rank) -> bool {
        dest < self.mailboxes.len()
    }
}

impl Drop for LocalWire {
    fn drop(&mut self) {
        self.mailboxes[self.rank].close();
    }
}
