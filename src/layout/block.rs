use std::ops::Range;

use xxhash_rust::xxh3::xxh3_64_with_seed;

use super::{check_range, DsmType, Extent, LayoutError, LayoutPolicy};
use crate::comm::Rank;

/// Page geometry shared by the blocked layouts
#[derive(Debug, Clone, Copy)]
struct Geometry {
    start: Rank,
    servers: usize,
    block: u64,
    pages_per_rank: u64,
}

impl Geometry {
    /// `length` is rounded down to a whole number of pages
    fn new(start: Rank, end: Rank, length: u64, block: u64) -> Result<Self, LayoutError> {
        let servers = check_range(start, end)?;
        if length == 0 || block == 0 {
            return Err(LayoutError::ZeroLength);
        }
        let pages_per_rank = length / block;
        if pages_per_rank == 0 {
            return Err(LayoutError::BlockTooLarge {
                block_length: block,
                length,
            });
        }
        let total_pages = pages_per_rank * servers as u64;
        if total_pages > u32::MAX as u64 {
            return Err(LayoutError::TooManyPages(total_pages));
        }
        Ok(Self {
            start,
            servers,
            block,
            pages_per_rank,
        })
    }

    fn length(&self) -> u64 {
        self.pages_per_rank * self.block
    }

    fn total_pages(&self) -> u64 {
        self.pages_per_rank * self.servers as u64
    }

    fn total_length(&self) -> u64 {
        self.total_pages() * self.block
    }

    fn index_of(&self, rank: Rank) -> Option<usize> {
        rank.checked_sub(self.start).filter(|i| *i < self.servers)
    }

    /// Turn a (server index, local page) placement of `page` into an extent
    fn extent(&self, address: u64, page: u64, index: u64, local_page: u64) -> Extent {
        Extent {
            rank: self.start + index as Rank,
            offset: local_page * self.block + address % self.block,
            end: (page + 1) * self.block,
        }
    }

    fn page_range(&self, page: u64) -> Range<u64> {
        page * self.block..(page + 1) * self.block
    }
}

/// Pages dealt round-robin over the servers
#[derive(Debug, Clone)]
pub struct BlockCyclicLayout {
    geometry: Geometry,
}

impl BlockCyclicLayout {
    pub fn new(start: Rank, end: Rank, length: u64, block_length: u64) -> Result<Self, LayoutError> {
        Ok(Self {
            geometry: Geometry::new(start, end, length, block_length)?,
        })
    }
}

impl LayoutPolicy for BlockCyclicLayout {
    fn dsm_type(&self) -> DsmType {
        DsmType::BlockCyclic
    }

    fn start_server(&self) -> Rank {
        self.geometry.start
    }

    fn server_count(&self) -> usize {
        self.geometry.servers
    }

    fn total_length(&self) -> u64 {
        self.geometry.total_length()
    }

    fn segment_length(&self, rank: Rank) -> u64 {
        let g = &self.geometry;
        g.index_of(rank).map_or(0, |_| g.length())
    }

    fn locate(&self, address: u64) -> Option<Extent> {
        let g = &self.geometry;
        if address >= g.total_length() {
            return None;
        }
        let n = g.servers as u64;
        let page = address / g.block;
        Some(g.extent(address, page, page % n, page / n))
    }

    fn rank_ranges(&self, rank: Rank) -> Vec<Range<u64>> {
        let g = &self.geometry;
        let Some(index) = g.index_of(rank) else {
            return Vec::new();
        };
        (index as u64..g.total_pages())
            .step_by(g.servers)
            .map(|page| g.page_range(page))
            .collect()
    }

    fn length(&self) -> u64 {
        self.geometry.length()
    }

    fn block_length(&self) -> u64 {
        self.geometry.block
    }
}

/// Pages shuffled by a seeded hash, then dealt round-robin so every server
/// still holds the same number of pages
#[derive(Debug, Clone)]
pub struct BlockRandomLayout {
    geometry: Geometry,
    seed: u64,
    /// global page -> (server index, local page)
    placement: Vec<(u32, u32)>,
}

impl BlockRandomLayout {
    pub fn new(
        start: Rank,
        end: Rank,
        length: u64,
        block_length: u64,
        seed: u64,
    ) -> Result<Self, LayoutError> {
        let geometry = Geometry::new(start, end, length, block_length)?;
        let total = geometry.total_pages() as u32;

        let mut order: Vec<(u64, u32)> = (0..total)
            .map(|page| (xxh3_64_with_seed(&page.to_le_bytes(), seed), page))
            .collect();
        order.sort_unstable();

        let n = geometry.servers as u32;
        let mut placement = vec![(0u32, 0u32); total as usize];
        for (k, (_, page)) in order.into_iter().enumerate() {
            let k = k as u32;
            placement[page as usize] = (k % n, k / n);
        }

        Ok(Self {
            geometry,
            seed,
            placement,
        })
    }
}

impl LayoutPolicy for BlockRandomLayout {
    fn dsm_type(&self) -> DsmType {
        DsmType::BlockRandom
    }

    fn start_server(&self) -> Rank {
        self.geometry.start
    }

    fn server_count(&self) -> usize {
        self.geometry.servers
    }

    fn total_length(&self) -> u64 {
        self.geometry.total_length()
    }

    fn segment_length(&self, rank: Rank) -> u64 {
        let g = &self.geometry;
        g.index_of(rank).map_or(0, |_| g.length())
    }

    fn locate(&self, address: u64) -> Option<Extent> {
        let g = &self.geometry;
        if address >= g.total_length() {
            return None;
        }
        let page = address / g.block;
        let (index, local) = self.placement[page as usize];
        Some(g.extent(address, page, index as u64, local as u64))
    }

    fn rank_ranges(&self, rank: Rank) -> Vec<Range<u64>> {
        let g = &self.geometry;
        let Some(index) = g.index_of(rank) else {
            return Vec::new();
        };
        self.placement
            .iter()
            .enumerate()
            .filter(|(_, (i, _))| *i as usize == index)
            .map(|(page, _)| g.page_range(page as u64))
            .collect()
    }

    fn length(&self) -> u64 {
        self.geometry.length()
    }

    fn block_length(&self) -> u64 {
        self.geometry.block
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}
