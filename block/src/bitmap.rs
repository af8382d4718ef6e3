// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::sync::atomic::{AtomicU64, Ordering};

use crate::SECTORS_PER_DIRTY_CHUNK;

/// Dirty bitmap with one bit per dirty-tracking chunk.
///
/// Bits are set by the write path on guest writes and cleared by the
/// migration code once a chunk has been submitted for transfer. Both
/// sides may race, so the words are atomic; a reset of a range only
/// clears the bits covering that range and leaves concurrent sets of
/// other chunks intact.
pub struct DirtyBitmap {
    words: Vec<AtomicU64>,
    nb_chunks: u64,
}

impl DirtyBitmap {
    pub fn new(nb_sectors: u64) -> Self {
        let nb_chunks = nb_sectors.div_ceil(SECTORS_PER_DIRTY_CHUNK);
        let nb_words = nb_chunks.div_ceil(u64::BITS as u64) as usize;
        let mut words = Vec::with_capacity(nb_words);
        words.resize_with(nb_words, || AtomicU64::new(0));
        DirtyBitmap { words, nb_chunks }
    }

    fn chunk_range(&self, sector: u64, nb_sectors: u64) -> (u64, u64) {
        let first = sector / SECTORS_PER_DIRTY_CHUNK;
        let last = (sector + nb_sectors.max(1) - 1) / SECTORS_PER_DIRTY_CHUNK;
        (first, last.min(self.nb_chunks.saturating_sub(1)))
    }

    /// Mark all chunks touched by `[sector, sector + nb_sectors)` dirty.
    pub fn mark_dirty(&self, sector: u64, nb_sectors: u64) {
        let (first, last) = self.chunk_range(sector, nb_sectors);
        for chunk in first..=last {
            let idx = (chunk / u64::BITS as u64) as usize;
            let bit = chunk % u64::BITS as u64;
            self.words[idx].fetch_or(1 << bit, Ordering::AcqRel);
        }
    }

    /// Whether the chunk containing `sector` is dirty.
    pub fn is_dirty(&self, sector: u64) -> bool {
        let chunk = sector / SECTORS_PER_DIRTY_CHUNK;
        if chunk >= self.nb_chunks {
            return false;
        }
        let idx = (chunk / u64::BITS as u64) as usize;
        let bit = chunk % u64::BITS as u64;
        self.words[idx].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Clear the dirty bits of all chunks touched by
    /// `[sector, sector + nb_sectors)`.
    pub fn reset(&self, sector: u64, nb_sectors: u64) {
        let (first, last) = self.chunk_range(sector, nb_sectors);
        for chunk in first..=last {
            let idx = (chunk / u64::BITS as u64) as usize;
            let bit = chunk % u64::BITS as u64;
            self.words[idx].fetch_and(!(1 << bit), Ordering::AcqRel);
        }
    }

    /// Number of dirty chunks.
    pub fn count(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones() as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_reset() {
        // 10 chunks worth of sectors.
        let bitmap = DirtyBitmap::new(10 * SECTORS_PER_DIRTY_CHUNK);
        assert_eq!(bitmap.count(), 0);

        // A single-sector write dirties exactly one chunk.
        bitmap.mark_dirty(SECTORS_PER_DIRTY_CHUNK + 5, 1);
        assert!(bitmap.is_dirty(SECTORS_PER_DIRTY_CHUNK));
        assert!(!bitmap.is_dirty(0));
        assert_eq!(bitmap.count(), 1);

        // A write straddling a chunk boundary dirties both chunks.
        bitmap.mark_dirty(3 * SECTORS_PER_DIRTY_CHUNK - 1, 2);
        assert!(bitmap.is_dirty(2 * SECTORS_PER_DIRTY_CHUNK));
        assert!(bitmap.is_dirty(3 * SECTORS_PER_DIRTY_CHUNK));
        assert_eq!(bitmap.count(), 3);

        bitmap.reset(0, 4 * SECTORS_PER_DIRTY_CHUNK);
        assert_eq!(bitmap.count(), 0);
    }

    #[test]
    fn test_out_of_range_is_clean() {
        let bitmap = DirtyBitmap::new(2 * SECTORS_PER_DIRTY_CHUNK);
        bitmap.mark_dirty(0, 2 * SECTORS_PER_DIRTY_CHUNK);
        assert!(!bitmap.is_dirty(100 * SECTORS_PER_DIRTY_CHUNK));
    }

    #[test]
    fn test_short_device() {
        // Device shorter than one chunk still has one tracked chunk.
        let bitmap = DirtyBitmap::new(SECTORS_PER_DIRTY_CHUNK / 2);
        bitmap.mark_dirty(10, 1);
        assert!(bitmap.is_dirty(0));
        assert_eq!(bitmap.count(), 1);
    }
}
