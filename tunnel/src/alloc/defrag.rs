// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Block moves, swap region management and defragmentation of the TE-Data table

use hal::{TE_DATA, TE_DATA_WIDTH, TeHal, WriteMode};
#[allow(unused)]
use tracing::{debug, error, info, warn};

use super::{BlockCtrl, TeDataTable};
use crate::errors::TunnelError;

/// Re-points the references to a block that is being moved.
///
/// Called after the image of the block has been written at `to` and before the slots at
/// `ctrl.start` are released, so that anything still pointing at the old location sees a
/// complete block until it is re-pointed.
pub trait Relocate {
    fn relocate(
        &mut self,
        hal: &mut dyn TeHal,
        ctrl: &BlockCtrl,
        to: u32,
    ) -> Result<(), TunnelError>;
}

/// What a block move needs besides the table: register access and the owners of the blocks
pub struct MoveCtx<'a> {
    pub hal: &'a mut dyn TeHal,
    pub relocator: &'a mut dyn Relocate,
}

impl TeDataTable {
    /// Find the start of a free run of `len` slots, defragmenting the table if needed
    pub fn find(&mut self, len: u32, ctx: &mut MoveCtx<'_>) -> Result<u32, TunnelError> {
        if len == 0 {
            return Err(TunnelError::InvalidArgument("empty TE-Data block"));
        }
        if self.free_count < len + self.headroom {
            debug!(
                "TE-Data engine {}: {len} slots requested, {} free (headroom {})",
                self.engine, self.free_count, self.headroom
            );
            return Err(TunnelError::FlowFull);
        }
        if let Some(start) = self.scan(len) {
            return Ok(start);
        }
        self.defragment(len, ctx)?;
        self.scan(len).ok_or(TunnelError::FlowFull)
    }

    /// Move the block starting at `src` to the free run at `to`
    pub fn move_block(
        &mut self,
        src: u32,
        to: u32,
        ctx: &mut MoveCtx<'_>,
    ) -> Result<(), TunnelError> {
        let ctrl = self.block_at(src)?;
        let mut image = vec![0u32; ctrl.length as usize * TE_DATA_WIDTH];
        ctx.hal.read_block(&TE_DATA, src, self.engine, &mut image)?;
        self.reserve(to, ctrl.length, ctrl)?;
        ctx.hal
            .write_block(&TE_DATA, to, self.engine, &image, WriteMode::Posted)?;
        ctx.relocator.relocate(ctx.hal, &ctrl, to)?;
        self.free(src, ctrl.length)?;
        debug!(
            "TE-Data engine {}: moved {} {} of group {} from {src} to {to} ({} slots)",
            self.engine, ctrl.kind, ctrl.entry, ctrl.group, ctrl.length
        );
        Ok(())
    }

    fn can_shuttle(&self, len: u32) -> bool {
        len <= self.swap_size && !self.swap_in_use()
    }

    /// Move a block to `to` in two hops through the swap region. `to` may overlap the block.
    fn shuttle(&mut self, src: u32, to: u32, ctx: &mut MoveCtx<'_>) -> Result<(), TunnelError> {
        let swap = self.swap_base();
        self.move_block(src, swap, ctx)?;
        self.move_block(swap, to, ctx)
    }

    /// Grow the swap region to `new_size` slots, evacuating the blocks in the way.
    /// Returns false when the swap region is busy or the blocks cannot be evacuated.
    pub fn grow_swap(&mut self, new_size: u32, ctx: &mut MoveCtx<'_>) -> Result<bool, TunnelError> {
        if new_size <= self.swap_size {
            return Ok(true);
        }
        if self.swap_in_use() || new_size + 2 > self.size {
            return Ok(false);
        }
        let old_base = self.swap_base();
        let new_base = self.size - new_size;
        let mut victims = self.blocks();
        victims.retain(|b| b.end() > new_base);
        for victim in victims.iter().rev() {
            let Some(to) = self.scan_range(self.first_free, new_base, victim.length) else {
                debug!(
                    "TE-Data engine {}: no room to grow swap to {new_size}",
                    self.engine
                );
                return Ok(false);
            };
            self.move_block(victim.start, to, ctx)?;
        }
        self.free_count -= old_base - new_base;
        self.swap_size = new_size;
        self.first_free = self.first_free.min(new_base);
        info!(
            "TE-Data engine {}: swap region grown to {new_size} slots",
            self.engine
        );
        Ok(true)
    }

    /// Shrink the swap region towards `new_size` slots, never below the configured minimum.
    pub fn shrink_swap(&mut self, new_size: u32) {
        let new_size = new_size.max(self.min_swap);
        if new_size >= self.swap_size || self.swap_in_use() {
            return;
        }
        let old_base = self.swap_base();
        self.swap_size = new_size;
        self.free_count += self.swap_base() - old_base;
        self.first_free = self.first_free.min(old_base);
        info!(
            "TE-Data engine {}: swap region shrunk to {new_size} slots",
            self.engine
        );
    }

    /// Compact the table until a run of `needed` slots exists
    fn defragment(&mut self, needed: u32, ctx: &mut MoveCtx<'_>) -> Result<(), TunnelError> {
        info!(
            "TE-Data engine {}: defragmenting for {needed} slots ({} free, first free {})",
            self.engine, self.free_count, self.first_free
        );
        self.largest_block = self
            .blocks()
            .iter()
            .map(|b| b.length)
            .max()
            .unwrap_or(0);
        self.fill_holes(needed, ctx)?;
        if self.scan(needed).is_none() {
            self.repack(ctx)?;
        }
        Ok(())
    }

    /// From the first free slot forward, fill every hole with the highest block that fits in
    /// it, or slide the block right after the hole down through the swap region.
    fn fill_holes(&mut self, needed: u32, ctx: &mut MoveCtx<'_>) -> Result<(), TunnelError> {
        let base = self.swap_base();
        let mut cursor = self.first_free;
        while self.scan(needed).is_none() {
            let Some(hole) = self.next_free(cursor, base) else {
                break;
            };
            let hole_len = self.free_run(hole, base);
            let hole_end = hole + hole_len;
            if hole_end >= base {
                break;
            }
            let tail = self.blocks_in(hole_end, base);
            if let Some(fit) = tail.iter().rev().find(|b| b.length <= hole_len) {
                self.move_block(fit.start, hole, ctx)?;
                cursor = hole;
                continue;
            }
            let next = self.block_at(hole_end)?;
            if self.can_shuttle(next.length) {
                self.shuttle(next.start, hole, ctx)?;
                cursor = hole;
            } else {
                cursor = next.end();
            }
        }
        Ok(())
    }

    /// Slide every block, in ascending order, to the lowest free slot. Blocks larger than the
    /// swap region that cannot move directly get the swap region grown for a second pass.
    fn repack(&mut self, ctx: &mut MoveCtx<'_>) -> Result<(), TunnelError> {
        let mut second_pass = false;
        loop {
            let mut blocked = 0u32;
            let mut floor = 1u32;
            for block in self.blocks() {
                let Some(to) = self.next_free(floor, block.start) else {
                    floor = block.end();
                    continue;
                };
                if block.start - to >= block.length {
                    self.move_block(block.start, to, ctx)?;
                } else if self.can_shuttle(block.length) {
                    self.shuttle(block.start, to, ctx)?;
                } else {
                    blocked = blocked.max(block.length);
                    floor = block.end();
                    continue;
                }
                floor = to + block.length;
            }
            if blocked == 0 || second_pass {
                break;
            }
            second_pass = true;
            if !self.grow_swap(self.largest_block, ctx)? {
                break;
            }
        }
        let live = self.blocks().iter().map(|b| b.length).max().unwrap_or(0);
        self.largest_block = live;
        self.shrink_swap(live);
        Ok(())
    }
}
