// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Slot allocator of the TE-Data table of one tunneling engine.
//!
//! Every slot maps to the handle of the block that owns it, or to 0 when free. Handles map to
//! [`BlockCtrl`] records that tell which tunnel group object owns the block. The last
//! `swap_size` slots form the swap region, used as a relocation buffer when moving blocks; they
//! are never handed out by [`TeDataTable::find`] and are not counted as free.

mod defrag;
mod display;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test;

pub use defrag::{MoveCtx, Relocate};

use std::collections::BTreeMap;
use std::fmt::Display;
use tracectl::trace_target;
#[allow(unused)]
use tracing::{debug, error, info, warn};

use crate::errors::TunnelError;
use crate::pool::IndexPool;
use crate::types::{EngineId, GroupId};

trace_target!("tunnel-alloc", LevelFilter::INFO, &["tunnel"]);

/// Handle of an allocated block. 0 marks a free slot.
pub type BlockHandle = u32;

/// What a block holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// The records of the rules of a lookup bin
    RuleBin,
    /// The encap record of a shared encap flow
    SharedEncapFlow,
}

impl Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockKind::RuleBin => write!(f, "bin"),
            BlockKind::SharedEncapFlow => write!(f, "flow"),
        }
    }
}

/// Bookkeeping of an allocated block. The owner is identified by `(group, kind, entry)`,
/// where `entry` is the bin index or the flow id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCtrl {
    pub start: u32,
    pub length: u32,
    pub group: GroupId,
    pub kind: BlockKind,
    pub entry: u32,
}

impl BlockCtrl {
    #[must_use]
    pub fn new(group: GroupId, kind: BlockKind, entry: u32) -> Self {
        Self {
            start: 0,
            length: 0,
            group,
            kind,
            entry,
        }
    }

    #[must_use]
    pub fn end(&self) -> u32 {
        self.start + self.length
    }
}

/// Software state of the TE-Data table of one engine
#[derive(Debug)]
pub struct TeDataTable {
    engine: EngineId,
    size: u32,
    handler: Vec<BlockHandle>,
    controls: BTreeMap<BlockHandle, BlockCtrl>,
    handles: IndexPool,
    first_free: u32,
    free_count: u32,
    swap_size: u32,
    min_swap: u32,
    headroom: u32,
    largest_block: u32,
}

impl TeDataTable {
    pub fn new(
        engine: EngineId,
        size: u32,
        min_swap: u32,
        headroom: u32,
    ) -> Result<Self, TunnelError> {
        if min_swap == 0 || size < min_swap + 2 {
            return Err(TunnelError::InvalidConfig(format!(
                "TE-Data table of {size} slots cannot hold a swap region of {min_swap}"
            )));
        }
        let swap_base = size - min_swap;
        Ok(Self {
            engine,
            size,
            handler: vec![0; size as usize],
            controls: BTreeMap::new(),
            handles: IndexPool::new(1, size),
            first_free: 1,
            free_count: swap_base - 1,
            swap_size: min_swap,
            min_swap,
            headroom,
            largest_block: 0,
        })
    }

    #[must_use]
    pub fn engine(&self) -> EngineId {
        self.engine
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of free slots outside the swap region
    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    /// Lowest free slot outside the swap region, or the swap base if there is none
    #[must_use]
    pub fn first_free(&self) -> u32 {
        self.first_free
    }

    #[must_use]
    pub fn swap_size(&self) -> u32 {
        self.swap_size
    }

    /// First slot of the swap region
    #[must_use]
    pub fn swap_base(&self) -> u32 {
        self.size - self.swap_size
    }

    /// Number of slots that blocks may occupy outside the swap region
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.swap_base() - 1
    }

    /// Largest block seen by the last defragmentation or allocated since
    #[must_use]
    pub fn largest_block(&self) -> u32 {
        self.largest_block
    }

    #[must_use]
    pub fn headroom(&self) -> u32 {
        self.headroom
    }

    #[must_use]
    pub fn is_free(&self, slot: u32) -> bool {
        self.handler.get(slot as usize).is_some_and(|h| *h == 0)
    }

    /// The block owning `slot`, if any
    #[must_use]
    pub fn ctrl_at(&self, slot: u32) -> Option<&BlockCtrl> {
        let handle = *self.handler.get(slot as usize)?;
        if handle == 0 {
            return None;
        }
        self.controls.get(&handle)
    }

    /// The block starting exactly at `start`
    pub fn block_at(&self, start: u32) -> Result<BlockCtrl, TunnelError> {
        match self.ctrl_at(start) {
            Some(ctrl) if ctrl.start == start => Ok(*ctrl),
            Some(ctrl) => Err(self.fault(format!(
                "slot {start} is inside block {}-{}",
                ctrl.start,
                ctrl.end() - 1
            ))),
            None => Err(self.fault(format!("no block at slot {start}"))),
        }
    }

    /// All blocks outside the swap region, by ascending start
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockCtrl> {
        self.blocks_in(1, self.swap_base())
    }

    /// Blocks starting in `[from, to)`, by ascending start
    fn blocks_in(&self, from: u32, to: u32) -> Vec<BlockCtrl> {
        let mut blocks: Vec<BlockCtrl> = self
            .controls
            .values()
            .filter(|c| c.start >= from && c.start < to)
            .copied()
            .collect();
        blocks.sort_by_key(|c| c.start);
        blocks
    }

    /// Whether some block occupies the swap region
    #[must_use]
    pub fn swap_in_use(&self) -> bool {
        self.handler[self.swap_base() as usize..]
            .iter()
            .any(|h| *h != 0)
    }

    /// Number of slots held by blocks of `group`
    #[must_use]
    pub fn used_by_group(&self, group: GroupId) -> u32 {
        self.controls
            .values()
            .filter(|c| c.group == group)
            .map(|c| c.length)
            .sum()
    }

    /// Number of free slots starting at `from`, not going past `limit`
    fn free_run(&self, from: u32, limit: u32) -> u32 {
        let limit = limit.min(self.size);
        let mut slot = from;
        while slot < limit && self.handler[slot as usize] == 0 {
            slot += 1;
        }
        slot - from
    }

    /// The lowest free slot in `[from, limit)`
    fn next_free(&self, from: u32, limit: u32) -> Option<u32> {
        let mut slot = from.max(1);
        while slot < limit.min(self.size) {
            match self.ctrl_at(slot) {
                None => return Some(slot),
                Some(ctrl) => slot = ctrl.end(),
            }
        }
        None
    }

    /// First run of `len` free slots in `[from, limit)`
    fn scan_range(&self, from: u32, limit: u32, len: u32) -> Option<u32> {
        if len == 0 {
            return None;
        }
        let mut slot = from.max(1);
        while slot + len <= limit {
            if let Some(ctrl) = self.ctrl_at(slot) {
                slot = ctrl.end();
                continue;
            }
            let run = self.free_run(slot, limit);
            if run >= len {
                return Some(slot);
            }
            slot += run;
        }
        None
    }

    /// First run of `len` free slots outside the swap region, searching from the first free slot
    #[must_use]
    pub fn scan(&self, len: u32) -> Option<u32> {
        self.scan_range(self.first_free, self.swap_base(), len)
    }

    /// Slots of `[start, start + len)` outside the swap region
    fn normal_slots(&self, start: u32, len: u32) -> u32 {
        let base = self.swap_base();
        if start >= base {
            0
        } else {
            (start + len).min(base) - start
        }
    }

    fn advance_first_free(&mut self) {
        let base = self.swap_base();
        self.first_free = self.next_free(self.first_free, base).unwrap_or(base);
    }

    /// Log and build an internal consistency error
    fn fault(&self, what: String) -> TunnelError {
        error!("TE-Data engine {}: {what}", self.engine);
        TunnelError::Internal(what)
    }

    /// Mark `[start, start + len)` as owned by a new block described by `ctrl`
    pub fn reserve(
        &mut self,
        start: u32,
        len: u32,
        ctrl: BlockCtrl,
    ) -> Result<BlockHandle, TunnelError> {
        if len == 0 || start == 0 || start + len > self.size {
            return Err(self.fault(format!("cannot reserve {len} slots at {start}")));
        }
        let range = start as usize..(start + len) as usize;
        if let Some(slot) = self.handler[range.clone()].iter().position(|h| *h != 0) {
            return Err(self.fault(format!(
                "reserve of {start}+{len} overlaps used slot {}",
                start as usize + slot
            )));
        }
        let Some(handle) = self.handles.take_first() else {
            return Err(self.fault("out of block handles".to_string()));
        };
        self.handler[range].fill(handle);
        self.controls.insert(
            handle,
            BlockCtrl {
                start,
                length: len,
                ..ctrl
            },
        );
        self.free_count -= self.normal_slots(start, len);
        if start <= self.first_free && self.first_free < start + len {
            self.advance_first_free();
        }
        self.largest_block = self.largest_block.max(len);
        debug!(
            "TE-Data engine {}: reserved {start}+{len} handle {handle} for {} {} of group {}",
            self.engine, ctrl.kind, ctrl.entry, ctrl.group
        );
        Ok(handle)
    }

    /// Release the block at `[start, start + len)` and return its bookkeeping
    pub fn free(&mut self, start: u32, len: u32) -> Result<BlockCtrl, TunnelError> {
        let handle = match self.handler.get(start as usize) {
            Some(&h) if h != 0 => h,
            _ => return Err(self.fault(format!("free of unused slot {start}"))),
        };
        let Some(ctrl) = self.controls.get(&handle).copied() else {
            return Err(self.fault(format!("slot {start} has unknown handle {handle}")));
        };
        if ctrl.start != start || ctrl.length != len {
            return Err(self.fault(format!(
                "free of {start}+{len} does not match block {}+{}",
                ctrl.start, ctrl.length
            )));
        }
        let end = start + len;
        let before = self.handler[start as usize - 1];
        let after = self.handler.get(end as usize).copied().unwrap_or(0);
        if before == handle || after == handle {
            return Err(self.fault(format!("block {start}+{len} is not bounded")));
        }
        let range = start as usize..end as usize;
        if self.handler[range.clone()].iter().any(|h| *h != handle) {
            return Err(self.fault(format!("block {start}+{len} overlaps another block")));
        }
        self.handler[range].fill(0);
        self.controls.remove(&handle);
        self.handles.release(handle);
        self.free_count += self.normal_slots(start, len);
        if start < self.first_free {
            self.first_free = start;
        }
        debug!(
            "TE-Data engine {}: freed {start}+{len} handle {handle}",
            self.engine
        );
        Ok(ctrl)
    }

    /// Check the partition of the slots into free runs and blocks
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.handler[0] != 0 {
            return Err(self.fault("slot 0 is allocated".to_string()));
        }
        let mut occupied = 0u32;
        for (handle, ctrl) in &self.controls {
            if ctrl.start == 0 || ctrl.length == 0 || ctrl.end() > self.size {
                return Err(self.fault(format!(
                    "handle {handle} has bad range {}+{}",
                    ctrl.start, ctrl.length
                )));
            }
            let range = ctrl.start as usize..ctrl.end() as usize;
            if self.handler[range].iter().any(|h| h != handle) {
                return Err(self.fault(format!(
                    "slots of handle {handle} at {}+{} are not all owned by it",
                    ctrl.start, ctrl.length
                )));
            }
            occupied += ctrl.length;
        }
        let used = self.handler.iter().filter(|h| **h != 0).count();
        if used != occupied as usize {
            return Err(self.fault(format!(
                "{used} slots are marked used but blocks cover {occupied}"
            )));
        }
        let base = self.swap_base();
        let free = (1..base).filter(|s| self.handler[*s as usize] == 0).count();
        if free != self.free_count as usize {
            return Err(self.fault(format!(
                "{free} free slots but free count is {}",
                self.free_count
            )));
        }
        let lowest = self.next_free(1, base).unwrap_or(base);
        if lowest != self.first_free {
            return Err(self.fault(format!(
                "first free slot is {lowest} but hint is {}",
                self.first_free
            )));
        }
        Ok(())
    }
}
