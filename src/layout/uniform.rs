use std::ops::Range;

use super::{check_range, DsmType, Extent, LayoutError, LayoutPolicy};
use crate::comm::Rank;

/// Each server owns one contiguous `length`-byte slice, in rank order
#[derive(Debug, Clone)]
pub struct UniformLayout {
    kind: DsmType,
    start: Rank,
    servers: usize,
    length: u64,
}

impl UniformLayout {
    pub fn new(kind: DsmType, start: Rank, end: Rank, length: u64) -> Result<Self, LayoutError> {
        let servers = check_range(start, end)?;
        if length == 0 {
            return Err(LayoutError::ZeroLength);
        }
        Ok(Self {
            kind,
            start,
            servers,
            length,
        })
    }

    fn index_of(&self, rank: Rank) -> Option<usize> {
        rank.checked_sub(self.start).filter(|i| *i < self.servers)
    }
}

impl LayoutPolicy for UniformLayout {
    fn dsm_type(&self) -> DsmType {
        self.kind
    }

    fn start_server(&self) -> Rank {
        self.start
    }

    fn server_count(&self) -> usize {
        self.servers
    }

    fn total_length(&self) -> u64 {
        self.length * self.servers as u64
    }

    fn segment_length(&self, rank: Rank) -> u64 {
        self.index_of(rank).map_or(0, |_| self.length)
    }

    fn locate(&self, address: u64) -> Option<Extent> {
        if address >= self.total_length() {
            return None;
        }
        let index = address / self.length;
        Some(Extent {
            rank: self.start + index as Rank,
            offset: address % self.length,
            end: (index + 1) * self.length,
        })
    }

    fn rank_ranges(&self, rank: Rank) -> Vec<Range<u64>> {
        match self.index_of(rank) {
            Some(i) => {
                let begin = i as u64 * self.length;
                vec![begin..begin + self.length]
            }
            None => Vec::new(),
        }
    }

    fn length(&self) -> u64 {
        self.length
    }
}
