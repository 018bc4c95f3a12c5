use std::collections::BTreeMap;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use super::{check_range, DsmType, Extent, LayoutError, LayoutPolicy};
use crate::comm::Rank;

/// One row of a mixed layout table: the next `length` bytes of the address
/// space belong to `rank`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedExtent {
    pub rank: Rank,
    pub length: u64,
}

/// Explicit extent table, in address order
///
/// A rank may appear several times. Its extents are packed back to back in
/// its local segment in the order they appear.
#[derive(Debug, Clone)]
pub struct MixedLayout {
    start: Rank,
    servers: usize,
    extents: Vec<MixedExtent>,
    /// Global start address of each extent
    starts: Vec<u64>,
    /// Local segment offset of each extent
    local_offsets: Vec<u64>,
    segments: BTreeMap<Rank, u64>,
    total: u64,
}

impl MixedLayout {
    pub fn new(start: Rank, end: Rank, extents: Vec<MixedExtent>) -> Result<Self, LayoutError> {
        let servers = check_range(start, end)?;
        if extents.is_empty() {
            return Err(LayoutError::InvalidTable("no extents".to_string()));
        }

        let mut starts = Vec::with_capacity(extents.len());
        let mut local_offsets = Vec::with_capacity(extents.len());
        let mut segments = BTreeMap::new();
        let mut total = 0u64;
        for extent in &extents {
            if extent.rank < start || extent.rank > end {
                return Err(LayoutError::InvalidTable(format!(
                    "rank {} is outside servers {}..={}",
                    extent.rank, start, end
                )));
            }
            if extent.length == 0 {
                return Err(LayoutError::InvalidTable(format!(
                    "empty extent for rank {}",
                    extent.rank
                )));
            }
            let segment = segments.entry(extent.rank).or_insert(0u64);
            starts.push(total);
            local_offsets.push(*segment);
            *segment += extent.length;
            total = total.checked_add(extent.length).ok_or_else(|| {
                LayoutError::InvalidTable("total length overflows".to_string())
            })?;
        }

        Ok(Self {
            start,
            servers,
            extents,
            starts,
            local_offsets,
            segments,
            total,
        })
    }
}

impl LayoutPolicy for MixedLayout {
    fn dsm_type(&self) -> DsmType {
        DsmType::Mixed
    }

    fn start_server(&self) -> Rank {
        self.start
    }

    fn server_count(&self) -> usize {
        self.servers
    }

    fn total_length(&self) -> u64 {
        self.total
    }

    fn segment_length(&self, rank: Rank) -> u64 {
        self.segments.get(&rank).copied().unwrap_or(0)
    }

    fn locate(&self, address: u64) -> Option<Extent> {
        if address >= self.total {
            return None;
        }
        // starts[0] == 0, so the partition point is at least 1
        let i = self.starts.partition_point(|s| *s <= address) - 1;
        let begin = self.starts[i];
        Some(Extent {
            rank: self.extents[i].rank,
            offset: self.local_offsets[i] + (address - begin),
            end: begin + self.extents[i].length,
        })
    }

    fn rank_ranges(&self, rank: Rank) -> Vec<Range<u64>> {
        self.extents
            .iter()
            .zip(&self.starts)
            .filter(|(e, _)| e.rank == rank)
            .map(|(e, s)| *s..*s + e.length)
            .collect()
    }

    fn length(&self) -> u64 {
        0
    }

    fn mixed_table(&self) -> Vec<MixedExtent> {
        self.extents.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Vec<MixedExtent> {
        vec![
            MixedExtent { rank: 1, length: 10 },
            MixedExtent { rank: 0, length: 5 },
            MixedExtent { rank: 1, length: 3 },
        ]
    }

    #[test]
    fn test_repeated_rank_packs_segment() {
        let layout = MixedLayout::new(0, 1, table()).unwrap();
        assert_eq!(layout.total_length(), 18);
        assert_eq!(layout.segment_length(1), 13);
        assert_eq!(layout.segment_length(0), 5);
        assert_eq!(layout.locate(16).unwrap(), Extent { rank: 1, offset: 11, end: 18 });
        assert_eq!(layout.locate(10).unwrap(), Extent { rank: 0, offset: 0, end: 15 });
        assert_eq!(layout.rank_ranges(1), vec![0..10, 15..18]);
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(MixedLayout::new(0, 1, Vec::new()).is_err());
        assert!(MixedLayout::new(0, 1, vec![MixedExtent { rank: 2, length: 1 }]).is_err());
        assert!(MixedLayout::new(0, 1, vec![MixedExtent { rank: 0, length: 0 }]).is_err());
    }
}
