//! # Free-Space Accounting
//!
//! Tracks which device blocks are in use. The commit pipeline asks it for
//! chunk placement (`allocate` under the reuse-space policy, or the end of
//! the used region when appending), recovery rebuilds it from the chunk
//! table, and reclamation returns blocks with `free_blocks`.
//!
//! Blocks 0 and 1 hold the store header copies and are permanently used.
//!
//! The used set is a roaring bitmap over block indices. Allocation is
//! first-fit: walk the gaps until one is wide enough. Chunk counts are
//! small (reclamation and compaction keep the tail short), so a scan beats
//! maintaining a parallel free-extent structure.
//!
//! Not thread-safe on its own; the owning `FileStore` wraps it in a mutex.

use roaring::RoaringBitmap;

use super::{BLOCK_SIZE, STORE_HEADER_BLOCKS};

#[derive(Debug)]
pub struct FreeSpaceMap {
    used: RoaringBitmap,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        let mut used = RoaringBitmap::new();
        used.insert_range(0..STORE_HEADER_BLOCKS as u32);
        Self { used }
    }

    /// Resets to the initial state (only the header blocks used).
    pub fn clear(&mut self) {
        self.used.clear();
        self.used.insert_range(0..STORE_HEADER_BLOCKS as u32);
    }

    pub fn mark_used(&mut self, block: u64, blocks: u64) {
        self.used.insert_range(block as u32..(block + blocks) as u32);
    }

    pub fn free_blocks(&mut self, block: u64, blocks: u64) {
        self.used.remove_range(block as u32..(block + blocks) as u32);
    }

    pub fn is_free(&self, block: u64, blocks: u64) -> bool {
        (block..block + blocks).all(|b| !self.used.contains(b as u32))
    }

    fn find_first_fit(&self, blocks: u64) -> u64 {
        let mut candidate = STORE_HEADER_BLOCKS;
        'scan: loop {
            while self.used.contains(candidate as u32) {
                candidate += 1;
            }
            for i in 0..blocks {
                if self.used.contains((candidate + i) as u32) {
                    candidate += i + 1;
                    continue 'scan;
                }
            }
            return candidate;
        }
    }

    /// Allocates `blocks` contiguous blocks, first fit, and marks them used.
    pub fn allocate(&mut self, blocks: u64) -> u64 {
        let block = self.find_first_fit(blocks);
        self.mark_used(block, blocks);
        block
    }

    /// Where `allocate` would place `blocks` blocks, without reserving them.
    pub fn predict_allocation(&self, blocks: u64) -> u64 {
        self.find_first_fit(blocks)
    }

    /// First free block (not necessarily wide enough for anything).
    pub fn first_free(&self) -> u64 {
        let mut b = STORE_HEADER_BLOCKS;
        while self.used.contains(b as u32) {
            b += 1;
        }
        b
    }

    /// One block past the last used block.
    pub fn end_of_used(&self) -> u64 {
        self.used.max().map_or(STORE_HEADER_BLOCKS, |b| b as u64 + 1)
    }

    /// Bytes up to and including the last used block.
    pub fn length_in_use(&self) -> u64 {
        self.end_of_used() * BLOCK_SIZE as u64
    }

    /// Percentage of blocks in use within the used span.
    pub fn fill_rate(&self) -> u8 {
        let span = self.end_of_used();
        let used = self.used.len();
        (used * 100 / span) as u8
    }
}

impl Default for FreeSpaceMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_blocks_start_used() {
        let fs = FreeSpaceMap::new();

        assert!(!fs.is_free(0, 2));
        assert_eq!(fs.first_free(), 2);
        assert_eq!(fs.end_of_used(), 2);
        assert_eq!(fs.length_in_use(), 2 * BLOCK_SIZE as u64);
    }

    #[test]
    fn allocate_is_first_fit() {
        let mut fs = FreeSpaceMap::new();

        assert_eq!(fs.allocate(3), 2);
        assert_eq!(fs.allocate(2), 5);
        assert_eq!(fs.end_of_used(), 7);
    }

    #[test]
    fn freed_gap_is_reused_when_wide_enough() {
        let mut fs = FreeSpaceMap::new();
        let a = fs.allocate(3);
        let _b = fs.allocate(4);
        fs.free_blocks(a, 3);

        // a 2-block request fits the gap, a 4-block request does not
        assert_eq!(fs.predict_allocation(2), a);
        assert_eq!(fs.predict_allocation(4), 9);
        assert_eq!(fs.allocate(2), a);
    }

    #[test]
    fn predict_does_not_reserve() {
        let mut fs = FreeSpaceMap::new();

        let p1 = fs.predict_allocation(2);
        let p2 = fs.predict_allocation(2);
        assert_eq!(p1, p2);

        assert_eq!(fs.allocate(2), p1);
        assert_ne!(fs.predict_allocation(2), p1);
    }

    #[test]
    fn fill_rate_reflects_holes() {
        let mut fs = FreeSpaceMap::new();
        let a = fs.allocate(4);
        fs.allocate(4);
        assert_eq!(fs.fill_rate(), 100);

        fs.free_blocks(a, 4);
        // 6 used of 10 spanned
        assert_eq!(fs.fill_rate(), 60);
    }

    #[test]
    fn clear_resets_to_header_only() {
        let mut fs = FreeSpaceMap::new();
        fs.allocate(10);
        fs.clear();

        assert_eq!(fs.end_of_used(), 2);
        assert!(fs.is_free(2, 10));
    }
}
