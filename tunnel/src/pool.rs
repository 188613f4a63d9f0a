// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Pools of small integer indexes

use roaring::RoaringBitmap;

/// A pool of indexes in `[first, end)`, holding the set of free indexes.
///
/// The pool keeps a cursor for [`IndexPool::peek_next`]: searches start at the cursor, taking
/// the suggested index moves the cursor past it, and releasing an index below the cursor moves
/// the cursor back to it, so that the lowest indexes are reused first.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IndexPool {
    free: RoaringBitmap,
    first: u32,
    end: u32,
    cursor: u32,
}

impl IndexPool {
    pub(crate) fn new(first: u32, end: u32) -> Self {
        let mut free = RoaringBitmap::new();
        if first < end {
            free.insert_range(first..end);
        }
        Self {
            free,
            first,
            end,
            cursor: first,
        }
    }

    fn contains(&self, index: u32) -> bool {
        (self.first..self.end).contains(&index)
    }

    /// The lowest free index at or after `from`
    fn first_free_from(&self, from: u32) -> Option<u32> {
        let below = if from == 0 { 0 } else { self.free.rank(from - 1) };
        self.free.select(u32::try_from(below).ok()?)
    }

    /// Take the lowest free index
    pub(crate) fn take_first(&mut self) -> Option<u32> {
        let index = self.free.min()?;
        self.free.remove(index);
        Some(index)
    }

    /// The first free index at or after the cursor, wrapping around
    pub(crate) fn peek_next(&self) -> Option<u32> {
        self.first_free_from(self.cursor)
            .or_else(|| self.first_free_from(self.first))
    }

    /// Take a specific index. Returns false if it is out of range or already taken.
    pub(crate) fn take(&mut self, index: u32) -> bool {
        let advance = self.peek_next() == Some(index);
        if !self.contains(index) || !self.free.remove(index) {
            return false;
        }
        if advance {
            self.cursor = index.saturating_add(1);
        }
        true
    }

    /// Return an index to the pool. Returns false if it was not taken.
    pub(crate) fn release(&mut self, index: u32) -> bool {
        if !self.contains(index) || !self.free.insert(index) {
            return false;
        }
        if index < self.cursor {
            self.cursor = index;
        }
        true
    }

    pub(crate) fn total(&self) -> u32 {
        self.end.saturating_sub(self.first)
    }

    pub(crate) fn available(&self) -> u32 {
        u32::try_from(self.free.len()).unwrap_or(u32::MAX)
    }
}
