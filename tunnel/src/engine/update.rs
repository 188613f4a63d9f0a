// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Installation of new block contents.
//!
//! A block is never rewritten in place. New content is written to free slots, the lookup entry
//! (or the flow pointer) is re-pointed with a confirmed write, and only then are the old slots
//! released. Blocks moved by defragmentation go through the same steps, driven by
//! [`Relocator`].

use hal::{LookupEntry, LookupFields, TE_DATA, TE_DATA_WIDTH, TeHal, WriteMode};
use std::collections::BTreeMap;
#[allow(unused)]
use tracing::{debug, error, info, warn};

use super::TunnelState;
use crate::alloc::{BlockCtrl, BlockKind, MoveCtx, Relocate};
use crate::codec::encap::encode_encap_flow;
use crate::codec::rule::{EncodedBin, encode_bin};
use crate::codec::{TeRecord, flow_ptr_slot, from_words, serialize, to_words};
use crate::errors::TunnelError;
use crate::model::bin::BlockRef;
use crate::model::flow::{EncapFlowParams, FlowPtr};
use crate::model::group::TunnelGroup;
use crate::types::{EngineId, FlowId, GroupId};

/// Log a failure that happened after hardware writes began
pub(crate) fn desync(e: TunnelError) -> TunnelError {
    error!("hardware and bookkeeping may have diverged: {e}");
    if e.is_clean() {
        TunnelError::Internal(e.to_string())
    } else {
        e
    }
}

pub(crate) fn lookup_entry(block: BlockRef) -> Result<LookupEntry, TunnelError> {
    let ptr = u16::try_from(block.start)
        .map_err(|_| TunnelError::internal(format!("block {block} beyond lookup range")))?;
    let len = u16::try_from(block.length)
        .map_err(|_| TunnelError::internal(format!("block {block} too long")))?;
    Ok(LookupEntry::new(ptr, len))
}

/// Re-points the owners of the blocks moved by the allocator of one engine
pub(crate) struct Relocator<'a> {
    engine: EngineId,
    groups: &'a mut BTreeMap<GroupId, TunnelGroup>,
}

impl Relocator<'_> {
    /// Current location of the block of an owner
    fn current(&self, owner: &BlockCtrl) -> Option<BlockRef> {
        let group = self.groups.get(&owner.group)?;
        match owner.kind {
            BlockKind::RuleBin => group.bins.get(&owner.entry)?.block,
            BlockKind::SharedEncapFlow => group.encap_flows.get(&owner.entry)?.block,
        }
    }
}

fn relocate_bin(
    hal: &mut dyn TeHal,
    engine: EngineId,
    group: &mut TunnelGroup,
    ctrl: &BlockCtrl,
    to: u32,
) -> Result<(), TunnelError> {
    let index = group.lookup_index(ctrl.entry);
    let direct = group.is_direct();
    let bin = group.bins.get_mut(&ctrl.entry).ok_or_else(|| {
        TunnelError::internal(format!(
            "block at {} owned by missing bin {} of group {}",
            ctrl.start, ctrl.entry, ctrl.group
        ))
    })?;
    if bin.block.map(|b| b.start) != Some(ctrl.start) {
        return Err(TunnelError::internal(format!(
            "bin {} of group {} is not at {}",
            ctrl.entry, ctrl.group, ctrl.start
        )));
    }
    let block = BlockRef::new(to, ctrl.length);
    if direct {
        let used = hal.get_flow_used_bit(engine, ctrl.start)?;
        hal.set_flow_used_bit(engine, to, used)?;
    }
    hal.set_lookup_entry(
        engine,
        index,
        lookup_entry(block)?,
        LookupFields::all(),
        WriteMode::Confirmed,
    )?;
    bin.block = Some(block);
    for (rule, offset) in &bin.rule_offsets {
        if let Some(rule) = group.rules.get_mut(rule)
            && rule.lookup_bin == ctrl.entry
        {
            rule.data_pos = to + offset;
        }
    }
    Ok(())
}

fn relocate_flow(
    hal: &mut dyn TeHal,
    engine: EngineId,
    group: &mut TunnelGroup,
    ctrl: &BlockCtrl,
    to: u32,
) -> Result<(), TunnelError> {
    let flow = group.encap_flows.get_mut(&ctrl.entry).ok_or_else(|| {
        TunnelError::internal(format!(
            "block at {} owned by missing encap flow {} of group {}",
            ctrl.start, ctrl.entry, ctrl.group
        ))
    })?;
    let moved = BlockRef::new(to, ctrl.length);
    if flow.block.is_some_and(|b| b.start == ctrl.start) {
        flow.block = Some(moved);
    } else if let Some(retired) = flow.retired.iter_mut().find(|b| b.start == ctrl.start) {
        *retired = moved;
    } else {
        return Err(TunnelError::internal(format!(
            "encap flow {} of group {} has no block at {}",
            ctrl.entry, ctrl.group, ctrl.start
        )));
    }
    let old = flow_ptr_slot(FlowPtr {
        index: ctrl.start,
        length: ctrl.length,
    });
    let new = to_words(&[flow_ptr_slot(FlowPtr::from(moved))]);
    for bin in group.bins.values().filter(|b| b.points_to(ctrl.entry)) {
        let Some(block) = bin.block else {
            continue;
        };
        for (_, offset) in bin.flow_ptrs.iter().filter(|(f, _)| *f == ctrl.entry) {
            let slot = block.start + offset;
            let mut words = [0u32; TE_DATA_WIDTH];
            hal.read_block(&TE_DATA, slot, engine, &mut words)?;
            if from_words(&words).first() == Some(&old) {
                hal.write_block(&TE_DATA, slot, engine, &new, WriteMode::Confirmed)?;
            }
        }
    }
    Ok(())
}

impl Relocate for Relocator<'_> {
    fn relocate(
        &mut self,
        hal: &mut dyn TeHal,
        ctrl: &BlockCtrl,
        to: u32,
    ) -> Result<(), TunnelError> {
        let group = self.groups.get_mut(&ctrl.group).ok_or_else(|| {
            TunnelError::internal(format!(
                "block at {} owned by missing group {}",
                ctrl.start, ctrl.group
            ))
        })?;
        match ctrl.kind {
            BlockKind::RuleBin => relocate_bin(hal, self.engine, group, ctrl, to),
            BlockKind::SharedEncapFlow => relocate_flow(hal, self.engine, group, ctrl, to),
        }
    }
}

impl<H: TeHal> TunnelState<H> {
    /// Find room for a new block of `len` slots replacing the block of `owner`, if any.
    ///
    /// When the table is too full and the block being replaced is at least as long as the new
    /// one, the old block is first moved to the swap region so that its slots can be reused.
    pub(crate) fn place_block(
        &mut self,
        engine: EngineId,
        len: u32,
        owner: &BlockCtrl,
    ) -> Result<u32, TunnelError> {
        let TunnelState {
            hal,
            engines,
            groups,
            ..
        } = self;
        let tedata = &mut engines
            .get_mut(usize::from(engine))
            .ok_or(TunnelError::InvalidArgument("no such tunneling engine"))?
            .tedata;
        let mut relocator = Relocator { engine, groups };

        let found = tedata.find(
            len,
            &mut MoveCtx {
                hal: &mut *hal,
                relocator: &mut relocator,
            },
        );
        if !matches!(found, Err(TunnelError::FlowFull)) {
            return found;
        }
        let old = match relocator.current(owner) {
            Some(old) if old.length >= len => old,
            _ => return Err(TunnelError::FlowFull),
        };
        let mut ctx = MoveCtx {
            hal: &mut *hal,
            relocator: &mut relocator,
        };
        if !tedata.grow_swap(old.length, &mut ctx)? {
            return Err(TunnelError::FlowFull);
        }
        // growing the swap region may have moved the old block
        let Some(old) = relocator.current(owner) else {
            return Err(TunnelError::internal("replaced block vanished"));
        };
        let mut ctx = MoveCtx {
            hal: &mut *hal,
            relocator: &mut relocator,
        };
        let swap = tedata.swap_base();
        tedata.move_block(old.start, swap, &mut ctx)?;
        match tedata.find(len, &mut ctx) {
            Ok(start) => {
                debug!(
                    "engine {engine}: {} {} of group {} moved to swap to make room for {len} slots",
                    owner.kind, owner.entry, owner.group
                );
                Ok(start)
            }
            Err(TunnelError::FlowFull) => {
                let back = tedata.scan(old.length).ok_or_else(|| {
                    TunnelError::internal("no room to move a block back out of the swap region")
                })?;
                tedata.move_block(swap, back, &mut ctx)?;
                Err(TunnelError::FlowFull)
            }
            Err(e) => Err(e),
        }
    }

    /// Write an encoded bin at `start` and point its lookup entry at it
    fn install_bin(
        &mut self,
        group_id: GroupId,
        bin: u32,
        start: u32,
        mut encoded: EncodedBin,
    ) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        let index = group.lookup_index(bin);
        let direct = group.is_direct();
        let old = group.bins.get(&bin).and_then(|b| b.block);
        // placing the block may have moved the shared flows it points to
        for (flow_id, offset) in &encoded.flow_ptrs {
            let Some(flow) = group.encap_flows.get(flow_id).and_then(|f| f.block) else {
                return Err(TunnelError::internal(format!(
                    "bin {bin} of group {group_id} points to encap flow {flow_id} without a block"
                )));
            };
            let Some(slot) = encoded.slots.get_mut(*offset as usize) else {
                return Err(TunnelError::internal(format!(
                    "flow pointer of bin {bin} of group {group_id} beyond its block"
                )));
            };
            *slot = flow_ptr_slot(FlowPtr::from(flow));
        }
        let block = BlockRef::new(start, encoded.len());
        let entry = lookup_entry(block)?;

        self.engine_mut(engine)?.tedata.reserve(
            start,
            block.length,
            BlockCtrl::new(group_id, BlockKind::RuleBin, bin),
        )?;
        self.hal.write_block(
            &TE_DATA,
            start,
            engine,
            &to_words(&encoded.slots),
            WriteMode::Posted,
        )?;
        if direct {
            self.hal.set_flow_used_bit(engine, start, false)?;
        }
        self.hal
            .set_lookup_entry(engine, index, entry, LookupFields::all(), WriteMode::Confirmed)?;
        if let Some(old) = old {
            self.engine_mut(engine)?.tedata.free(old.start, old.length)?;
        }

        let group = self.group_mut(group_id)?;
        let Some(lookup_bin) = group.bins.get_mut(&bin) else {
            return Err(TunnelError::internal(format!(
                "bin {bin} of group {group_id} vanished"
            )));
        };
        lookup_bin.block = Some(block);
        for (rule, offset) in &encoded.rule_offsets {
            if let Some(rule) = group.rules.get_mut(rule) {
                rule.data_pos = start + offset;
            }
        }
        lookup_bin.rule_offsets = encoded.rule_offsets;
        lookup_bin.flow_ptrs = encoded.flow_ptrs;
        debug!("group {group_id} bin {bin}: installed at {block}");
        Ok(())
    }

    /// Invalidate the lookup entry of an empty bin and release its block
    fn remove_bin(&mut self, group_id: GroupId, bin: u32) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        let index = group.lookup_index(bin);
        if let Some(old) = group.bins.get(&bin).and_then(|b| b.block) {
            self.hal.set_lookup_entry(
                engine,
                index,
                LookupEntry::invalid(),
                LookupFields::all(),
                WriteMode::Confirmed,
            )?;
            self.engine_mut(engine)?.tedata.free(old.start, old.length)?;
        }
        self.group_mut(group_id)?.bins.remove(&bin);
        debug!("group {group_id} bin {bin}: removed");
        Ok(())
    }

    /// Bring the block of bin `bin` in line with the rules the bin holds.
    ///
    /// Fails without side effects when the content cannot be encoded or placed. Failures after
    /// the first hardware write are internal errors.
    pub(crate) fn commit_bin(&mut self, group_id: GroupId, bin: u32) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        let Some(lookup_bin) = group.bins.get(&bin) else {
            return Err(TunnelError::internal(format!(
                "no bin {bin} in group {group_id}"
            )));
        };
        if lookup_bin.rules.is_empty() {
            return self.remove_bin(group_id, bin).map_err(desync);
        }
        let rules = lookup_bin
            .rules
            .iter()
            .map(|id| {
                group.rules.get(id).ok_or_else(|| {
                    TunnelError::internal(format!("bin {bin} holds missing rule {id}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let encoded = encode_bin(
            &group.params,
            bin,
            rules,
            &group.encap_flows,
            self.config.max_block_length,
        )?;
        let owner = BlockCtrl::new(group_id, BlockKind::RuleBin, bin);
        let start = self.place_block(engine, encoded.len(), &owner)?;
        self.install_bin(group_id, bin, start, encoded)
            .map_err(desync)
    }

    /// Write the block of a shared flow in free slots. The caller records its location.
    pub(crate) fn install_flow_block(
        &mut self,
        group_id: GroupId,
        flow_id: FlowId,
        params: &EncapFlowParams,
        counter: Option<u32>,
    ) -> Result<BlockRef, TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        let record = encode_encap_flow(group.params.tunnel_type, params, counter)?;
        let slots = serialize(&[TeRecord::Encap(record)]);
        let len = u32::try_from(slots.len())
            .map_err(|_| TunnelError::internal("encap flow block too long"))?;
        let owner = BlockCtrl::new(group_id, BlockKind::SharedEncapFlow, flow_id);
        let start = self.place_block(engine, len, &owner)?;
        let mut write = || -> Result<(), TunnelError> {
            self.engine_mut(engine)?.tedata.reserve(start, len, owner)?;
            self.hal
                .write_block(&TE_DATA, start, engine, &to_words(&slots), WriteMode::Posted)?;
            Ok(())
        };
        write().map_err(desync)?;
        let block = BlockRef::new(start, len);
        debug!("group {group_id} encap flow {flow_id}: block at {block}");
        Ok(block)
    }

    /// Commit several bins, in ascending order
    pub(crate) fn commit_bins(
        &mut self,
        group_id: GroupId,
        bins: impl IntoIterator<Item = u32>,
    ) -> Result<(), TunnelError> {
        for bin in bins {
            self.commit_bin(group_id, bin)?;
        }
        Ok(())
    }
}
