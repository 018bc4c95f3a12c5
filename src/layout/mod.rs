//! Address map: global byte address -> (owning rank, local offset).
//!
//! A [`LayoutPolicy`] classifies single addresses. It reports the contiguous
//! run an address belongs to, so callers can walk a range run by run, but it
//! never splits requests itself.

mod block;
mod mixed;
mod uniform;

use std::fmt::Debug;
use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use block::{BlockCyclicLayout, BlockRandomLayout};
pub use mixed::{MixedExtent, MixedLayout};
pub use uniform::UniformLayout;

use crate::comm::Rank;
use crate::protocol::{InfoMsg, MixedExtentWire};

/// Layout type codes exchanged in [`InfoMsg::dsm_type`]
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsmType {
    Uniform = 0,
    UniformRange = 1,
    Mixed = 2,
    BlockCyclic = 3,
    BlockRandom = 4,
}

impl TryFrom<i32> for DsmType {
    type Error = LayoutError;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => DsmType::Uniform,
            1 => DsmType::UniformRange,
            2 => DsmType::Mixed,
            3 => DsmType::BlockCyclic,
            4 => DsmType::BlockRandom,
            other => return Err(LayoutError::UnknownType(other)),
        })
    }
}

/// Where an address lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    /// Owning server rank
    pub rank: Rank,
    /// Offset of the address inside the owner's local segment
    pub offset: u64,
    /// Exclusive global end of the run that shares this owner and continues
    /// contiguously in its segment
    pub end: u64,
}

/// Layout errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("Unknown layout type {0}")]
    UnknownType(i32),

    #[error("Server range {start}..={end} is invalid for a group of {group_size}")]
    InvalidServerRange {
        start: Rank,
        end: Rank,
        group_size: usize,
    },

    #[error("Per-rank length must be non-zero")]
    ZeroLength,

    #[error("Block length {block_length} does not fit in per-rank length {length}")]
    BlockTooLarge { block_length: u64, length: u64 },

    #[error("Mixed layout table is invalid: {0}")]
    InvalidTable(String),

    #[error("Layout has too many pages ({0})")]
    TooManyPages(u64),
}

/// A rule mapping global addresses to server ranks
pub trait LayoutPolicy: Debug + Send + Sync {
    fn dsm_type(&self) -> DsmType;

    /// First server rank
    fn start_server(&self) -> Rank;

    /// Number of server ranks
    fn server_count(&self) -> usize;

    /// Size of the global address space
    fn total_length(&self) -> u64;

    /// Bytes of local segment owned by `rank` (0 for non-servers)
    fn segment_length(&self, rank: Rank) -> u64;

    /// Locate `address`, `None` when it is outside `[0, total_length)`
    fn locate(&self, address: u64) -> Option<Extent>;

    /// Global ranges owned by `rank`, in address order
    fn rank_ranges(&self, rank: Rank) -> Vec<Range<u64>>;

    /// Nominal per-rank length
    fn length(&self) -> u64;

    /// Page size, 0 when unblocked
    fn block_length(&self) -> u64 {
        0
    }

    fn seed(&self) -> u64 {
        0
    }

    fn mixed_table(&self) -> Vec<MixedExtent> {
        Vec::new()
    }
}

/// Which policy to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    Uniform,
    BlockCyclic,
    BlockRandom,
    Mixed,
}

/// Parameters from which every rank builds the same [`AddressMap`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutSpec {
    pub kind: LayoutKind,
    /// Per-rank length (ignored by mixed layouts)
    pub length: u64,
    pub block_length: u64,
    pub seed: u64,
    pub mixed: Vec<MixedExtent>,
    /// First server rank, default 0
    pub start_server: Option<Rank>,
    /// Last server rank (inclusive), default the last rank of the group
    pub end_server: Option<Rank>,
}

impl LayoutSpec {
    pub fn uniform(length: u64) -> Self {
        Self {
            kind: LayoutKind::Uniform,
            length,
            block_length: 0,
            seed: 0,
            mixed: Vec::new(),
            start_server: None,
            end_server: None,
        }
    }

    pub fn block_cyclic(length: u64, block_length: u64) -> Self {
        Self {
            kind: LayoutKind::BlockCyclic,
            block_length,
            ..Self::uniform(length)
        }
    }

    pub fn block_random(length: u64, block_length: u64, seed: u64) -> Self {
        Self {
            kind: LayoutKind::BlockRandom,
            block_length,
            seed,
            ..Self::uniform(length)
        }
    }

    pub fn mixed(extents: Vec<MixedExtent>) -> Self {
        Self {
            kind: LayoutKind::Mixed,
            mixed: extents,
            ..Self::uniform(0)
        }
    }

    pub fn with_servers(mut self, start: Rank, end: Rank) -> Self {
        self.start_server = Some(start);
        self.end_server = Some(end);
        self
    }

    /// Build the map for a group of `group_size` ranks
    pub fn build(&self, group_size: usize) -> Result<AddressMap, LayoutError> {
        let start = self.start_server.unwrap_or(0);
        let end = self
            .end_server
            .unwrap_or_else(|| group_size.saturating_sub(1));
        if group_size == 0 || start > end || end >= group_size {
            return Err(LayoutError::InvalidServerRange {
                start,
                end,
                group_size,
            });
        }
        let covers_group = start == 0 && end == group_size - 1;

        let policy: Arc<dyn LayoutPolicy> = match self.kind {
            LayoutKind::Uniform => {
                let kind = if covers_group {
                    DsmType::Uniform
                } else {
                    DsmType::UniformRange
                };
                Arc::new(UniformLayout::new(kind, start, end, self.length)?)
            }
            LayoutKind::BlockCyclic => Arc::new(BlockCyclicLayout::new(
                start,
                end,
                self.length,
                self.block_length,
            )?),
            LayoutKind::BlockRandom => Arc::new(BlockRandomLayout::new(
                start,
                end,
                self.length,
                self.block_length,
                self.seed,
            )?),
            LayoutKind::Mixed => Arc::new(MixedLayout::new(start, end, self.mixed.clone())?),
        };
        Ok(AddressMap { policy })
    }
}

/// Shared, immutable address map
#[derive(Debug, Clone)]
pub struct AddressMap {
    policy: Arc<dyn LayoutPolicy>,
}

impl AddressMap {
    pub fn from_policy(policy: Arc<dyn LayoutPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &dyn LayoutPolicy {
        self.policy.as_ref()
    }

    pub fn dsm_type(&self) -> DsmType {
        self.policy.dsm_type()
    }

    pub fn total_length(&self) -> u64 {
        self.policy.total_length()
    }

    pub fn length(&self) -> u64 {
        self.policy.length()
    }

    pub fn block_length(&self) -> u64 {
        self.policy.block_length()
    }

    pub fn is_paged(&self) -> bool {
        self.policy.block_length() > 0
    }

    pub fn start_server(&self) -> Rank {
        self.policy.start_server()
    }

    /// Last server rank, inclusive
    pub fn end_server(&self) -> Rank {
        self.policy.start_server() + self.policy.server_count() - 1
    }

    pub fn server_count(&self) -> usize {
        self.policy.server_count()
    }

    pub fn servers(&self) -> Range<Rank> {
        self.start_server()..self.end_server() + 1
    }

    pub fn is_server(&self, rank: Rank) -> bool {
        self.servers().contains(&rank)
    }

    pub fn segment_length(&self, rank: Rank) -> u64 {
        self.policy.segment_length(rank)
    }

    pub fn locate(&self, address: u64) -> Option<Extent> {
        self.policy.locate(address)
    }

    pub fn address_to_rank(&self, address: u64) -> Option<Rank> {
        self.locate(address).map(|e| e.rank)
    }

    pub fn rank_ranges(&self, rank: Rank) -> Vec<Range<u64>> {
        self.policy.rank_ranges(rank)
    }

    /// Number of pages in the address space (0 when unblocked)
    pub fn total_pages(&self) -> u64 {
        match self.block_length() {
            0 => 0,
            block => self.total_length() / block,
        }
    }

    /// Global address of the first byte of `page`
    pub fn page_address(&self, page: u32) -> u64 {
        page as u64 * self.block_length()
    }

    pub fn to_info(&self) -> (InfoMsg, Vec<MixedExtentWire>) {
        let table: Vec<MixedExtentWire> = self
            .policy
            .mixed_table()
            .into_iter()
            .map(|e| MixedExtentWire {
                length: e.length,
                rank: e.rank as u32,
                reserved: 0,
            })
            .collect();
        let info = InfoMsg {
            length: self.length(),
            total_length: self.total_length(),
            block_length: self.block_length(),
            seed: self.policy.seed(),
            dsm_type: self.dsm_type() as i32,
            start_server: self.start_server() as i32,
            end_server: self.end_server() as i32,
            mixed_entries: table.len() as u32,
        };
        (info, table)
    }

    /// Rebuild the map another rank described with [`AddressMap::to_info`]
    pub fn from_info(info: &InfoMsg, table: &[MixedExtentWire]) -> Result<Self, LayoutError> {
        let dsm_type = DsmType::try_from(info.dsm_type)?;
        let (start, end) = match (
            usize::try_from(info.start_server),
            usize::try_from(info.end_server),
        ) {
            (Ok(s), Ok(e)) if s <= e => (s, e),
            _ => {
                return Err(LayoutError::InvalidServerRange {
                    start: info.start_server.max(0) as usize,
                    end: info.end_server.max(0) as usize,
                    group_size: 0,
                })
            }
        };

        let policy: Arc<dyn LayoutPolicy> = match dsm_type {
            DsmType::Uniform | DsmType::UniformRange => {
                Arc::new(UniformLayout::new(dsm_type, start, end, info.length)?)
            }
            DsmType::BlockCyclic => Arc::new(BlockCyclicLayout::new(
                start,
                end,
                info.length,
                info.block_length,
            )?),
            DsmType::BlockRandom => Arc::new(BlockRandomLayout::new(
                start,
                end,
                info.length,
                info.block_length,
                info.seed,
            )?),
            DsmType::Mixed => Arc::new(MixedLayout::new(
                start,
                end,
                table
                    .iter()
                    .map(|row| MixedExtent {
                        rank: row.rank as Rank,
                        length: row.length,
                    })
                    .collect(),
            )?),
        };
        let map = Self { policy };
        if map.total_length() != info.total_length {
            return Err(LayoutError::InvalidTable(format!(
                "described total length {} but rebuilt {}",
                info.total_length,
                map.total_length()
            )));
        }
        Ok(map)
    }
}

pub(crate) fn check_range(start: Rank, end: Rank) -> Result<usize, LayoutError> {
    if start > end {
        return Err(LayoutError::InvalidServerRange {
            start,
            end,
            group_size: end + 1,
        });
    }
    Ok(end - start + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn specs() -> Vec<LayoutSpec> {
        vec![
            LayoutSpec::uniform(1024),
            LayoutSpec::uniform(100).with_servers(1, 2),
            LayoutSpec::block_cyclic(256, 64),
            LayoutSpec::block_random(256, 64, 42),
            LayoutSpec::mixed(vec![
                MixedExtent { rank: 2, length: 100 },
                MixedExtent { rank: 0, length: 50 },
                MixedExtent { rank: 2, length: 30 },
                MixedExtent { rank: 1, length: 70 },
            ]),
        ]
    }

    #[test]
    fn test_build_selects_uniform_range() {
        let full = LayoutSpec::uniform(10).build(4).unwrap();
        assert_eq!(full.dsm_type(), DsmType::Uniform);
        let partial = LayoutSpec::uniform(10).with_servers(1, 2).build(4).unwrap();
        assert_eq!(partial.dsm_type(), DsmType::UniformRange);
        assert_eq!(partial.servers(), 1..3);
        assert!(!partial.is_server(0));
        assert!(partial.is_server(2));
    }

    #[test]
    fn test_build_rejects_bad_server_range() {
        assert!(LayoutSpec::uniform(10).with_servers(2, 1).build(4).is_err());
        assert!(LayoutSpec::uniform(10).with_servers(0, 4).build(4).is_err());
        assert!(LayoutSpec::uniform(10).build(0).is_err());
    }

    #[test]
    fn test_four_rank_uniform_scenario() {
        let map = LayoutSpec::uniform(1024).build(4).unwrap();
        assert_eq!(map.total_length(), 4096);
        let e = map.locate(1500).unwrap();
        assert_eq!((e.rank, e.offset, e.end), (1, 476, 2048));
        let e = map.locate(2048).unwrap();
        assert_eq!((e.rank, e.offset), (2, 0));
        assert!(map.locate(4096).is_none());
        assert_eq!(map.rank_ranges(1), vec![1024..2048]);
    }

    #[test]
    fn test_block_cyclic_scenario() {
        let map = LayoutSpec::block_cyclic(256, 64).build(3).unwrap();
        let owners: Vec<Rank> = (0..4).map(|p| map.address_to_rank(p * 64).unwrap()).collect();
        assert_eq!(owners, vec![0, 1, 2, 0]);
        let e = map.locate(3 * 64 + 5).unwrap();
        assert_eq!((e.rank, e.offset, e.end), (0, 64 + 5, 4 * 64));
    }

    #[test]
    fn test_info_roundtrip_rebuilds_same_map() {
        for spec in specs() {
            let map = spec.build(3).unwrap();
            let (info, table) = map.to_info();
            let rebuilt = AddressMap::from_info(&info, &table).unwrap();
            assert_eq!(rebuilt.to_info(), (info, table));
            for a in (0..map.total_length()).step_by(7) {
                assert_eq!(map.locate(a), rebuilt.locate(a));
            }
        }
    }

    #[test]
    fn test_from_info_rejects_unknown_type() {
        let (mut info, table) = LayoutSpec::uniform(10).build(2).unwrap().to_info();
        info.dsm_type = 9;
        assert!(matches!(
            AddressMap::from_info(&info, &table),
            Err(LayoutError::UnknownType(9))
        ));
    }

    /// Every address has exactly one owner, every (rank, offset) pair is hit
    /// at most once, and the owned ranges partition the space.
    fn assert_partition(map: &AddressMap) {
        let total = map.total_length();
        let mut seen = std::collections::HashSet::new();
        for a in 0..total {
            let e = map.locate(a).expect("address inside the space");
            assert!(map.is_server(e.rank));
            assert!(e.offset < map.segment_length(e.rank));
            assert!(e.end > a && e.end <= total);
            assert!(seen.insert((e.rank, e.offset)), "slot hit twice");
        }
        let mut covered: u64 = 0;
        for rank in map.servers() {
            for r in map.rank_ranges(rank) {
                for a in r.clone() {
                    assert_eq!(map.address_to_rank(a), Some(rank));
                }
                covered += r.end - r.start;
            }
        }
        assert_eq!(covered, total);
    }

    #[test]
    fn test_fixed_layouts_partition() {
        for spec in specs() {
            assert_partition(&spec.build(3).unwrap());
        }
    }

    proptest! {
        #[test]
        fn prop_uniform_partitions(length in 1u64..64, servers in 1usize..5) {
            assert_partition(&LayoutSpec::uniform(length).build(servers).unwrap());
        }

        #[test]
        fn prop_block_layouts_partition(
            pages in 1u64..6,
            block in 1u64..16,
            servers in 1usize..5,
            seed in any::<u64>(),
            random in any::<bool>(),
        ) {
            let spec = if random {
                LayoutSpec::block_random(pages * block, block, seed)
            } else {
                LayoutSpec::block_cyclic(pages * block, block)
            };
            assert_partition(&spec.build(servers).unwrap());
        }

        #[test]
        fn prop_mixed_partitions(lengths in prop::collection::vec((0usize..3, 1u64..20), 1..6)) {
            let extents = lengths
                .into_iter()
                .map(|(rank, length)| MixedExtent { rank, length })
                .collect();
            assert_partition(&LayoutSpec::mixed(extents).build(3).unwrap());
        }
    }
}
