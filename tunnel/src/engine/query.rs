// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Read access to the tunnel objects, counters and used bits

use hal::{FlowCounter, TE_DATA, TE_DATA_WIDTH, TeHal};
use std::ops::Bound::{Excluded, Unbounded};

use super::TunnelState;
use super::update::lookup_entry;
use crate::alloc::{BlockCtrl, BlockKind};
use crate::codec::{Slot, decode_block, flow_ptr_slot, from_words};
use crate::errors::TunnelError;
use crate::manager::{TeDataUsage, TunnelUsage, UsageCount};
use crate::model::bin::BlockRef;
use crate::model::flow::{EncapFlow, FlowPtr};
use crate::model::group::TunnelGroupInfo;
use crate::model::rule::Rule;
use crate::types::{EngineId, FlowId, GroupId, RuleId};

/// What [`TunnelState::validate`] checks for one lookup bin
struct BinCheck {
    group: GroupId,
    bin: u32,
    index: u32,
    block: BlockRef,
    rules: usize,
    /// Flow pointer offsets, with the slot values they may hold
    ptrs: Vec<(FlowId, u32, Vec<Slot>)>,
}

impl<H: TeHal> TunnelState<H> {
    pub(crate) fn group_info(&self, group: GroupId) -> Result<TunnelGroupInfo, TunnelError> {
        Ok(self.group(group)?.info())
    }

    /// The group following `after`, or the first one
    pub(crate) fn group_after(&self, after: Option<GroupId>) -> Option<TunnelGroupInfo> {
        match after {
            None => self.groups.values().next(),
            Some(id) => self.groups.range((Excluded(id), Unbounded)).next().map(|(_, g)| g),
        }
        .map(crate::model::group::TunnelGroup::info)
    }

    pub(crate) fn rule(&self, group: GroupId, rule: RuleId) -> Result<&Rule, TunnelError> {
        self.group(group)?
            .rules
            .get(&rule)
            .ok_or(TunnelError::NoSuchRule(group, rule))
    }

    pub(crate) fn rule_after(
        &self,
        group: GroupId,
        after: Option<RuleId>,
    ) -> Result<Option<Rule>, TunnelError> {
        let rules = &self.group(group)?.rules;
        let next = match after {
            None => rules.values().next(),
            Some(id) => rules.range((Excluded(id), Unbounded)).next().map(|(_, r)| r),
        };
        Ok(next.cloned())
    }

    pub(crate) fn flow(&self, group: GroupId, flow: FlowId) -> Result<&EncapFlow, TunnelError> {
        self.group(group)?
            .encap_flows
            .get(&flow)
            .ok_or(TunnelError::NoEncapFlow(flow))
    }

    pub(crate) fn flow_after(
        &self,
        group: GroupId,
        after: Option<FlowId>,
    ) -> Result<Option<EncapFlow>, TunnelError> {
        let flows = &self.group(group)?.encap_flows;
        let next = match after {
            None => flows.values().next(),
            Some(id) => flows.range((Excluded(id), Unbounded)).next().map(|(_, f)| f),
        };
        Ok(next.cloned())
    }

    fn rule_counter_index(&self, group: GroupId, rule: RuleId) -> Result<(EngineId, u32), TunnelError> {
        let engine = self.group(group)?.params.engine;
        let counter = self
            .rule(group, rule)?
            .counter
            .ok_or(TunnelError::InvalidArgument("the rule has no counter"))?;
        Ok((engine, counter))
    }

    fn flow_counter_index(&self, group: GroupId, flow: FlowId) -> Result<(EngineId, u32), TunnelError> {
        let engine = self.group(group)?.params.engine;
        let counter = self
            .flow(group, flow)?
            .counter
            .ok_or(TunnelError::InvalidArgument("the encap flow has no counter"))?;
        Ok((engine, counter))
    }

    pub(crate) fn rule_counter(&mut self, group: GroupId, rule: RuleId) -> Result<FlowCounter, TunnelError> {
        let (engine, counter) = self.rule_counter_index(group, rule)?;
        Ok(self.hal.get_flow_counter(engine, counter)?)
    }

    pub(crate) fn reset_rule_counter(&mut self, group: GroupId, rule: RuleId) -> Result<(), TunnelError> {
        let (engine, counter) = self.rule_counter_index(group, rule)?;
        Ok(self
            .hal
            .set_flow_counter(engine, counter, FlowCounter::default())?)
    }

    pub(crate) fn flow_counter(&mut self, group: GroupId, flow: FlowId) -> Result<FlowCounter, TunnelError> {
        let (engine, counter) = self.flow_counter_index(group, flow)?;
        Ok(self.hal.get_flow_counter(engine, counter)?)
    }

    pub(crate) fn reset_flow_counter(&mut self, group: GroupId, flow: FlowId) -> Result<(), TunnelError> {
        let (engine, counter) = self.flow_counter_index(group, flow)?;
        Ok(self
            .hal
            .set_flow_counter(engine, counter, FlowCounter::default())?)
    }

    /// Used bits are kept per TE-Data slot, at the position of the rule
    fn used_bit_index(&self, group: GroupId, rule: RuleId) -> Result<(EngineId, u32), TunnelError> {
        let g = self.group(group)?;
        if !g.is_direct() {
            return Err(TunnelError::InvalidArgument(
                "used bits are only kept for direct lookup groups",
            ));
        }
        Ok((g.params.engine, self.rule(group, rule)?.data_pos))
    }

    pub(crate) fn rule_used(&mut self, group: GroupId, rule: RuleId) -> Result<bool, TunnelError> {
        let (engine, index) = self.used_bit_index(group, rule)?;
        Ok(self.hal.get_flow_used_bit(engine, index)?)
    }

    pub(crate) fn reset_rule_used(&mut self, group: GroupId, rule: RuleId) -> Result<(), TunnelError> {
        let (engine, index) = self.used_bit_index(group, rule)?;
        Ok(self.hal.set_flow_used_bit(engine, index, false)?)
    }

    /// First rule id not used in a direct group, from the allocation cursor
    pub(crate) fn next_free_direct_index(&self, group: GroupId) -> Result<Option<RuleId>, TunnelError> {
        self.group(group)?
            .direct
            .as_ref()
            .map(crate::pool::IndexPool::peek_next)
            .ok_or(TunnelError::InvalidArgument(
                "not a direct lookup group",
            ))
    }

    pub(crate) fn usage(&self, group: GroupId) -> Result<TunnelUsage, TunnelError> {
        let g = self.group(group)?;
        let state = self.engine(g.params.engine)?;
        let bins = u32::try_from(g.bins.len()).unwrap_or(u32::MAX);
        Ok(TunnelUsage {
            lookup: UsageCount {
                used: bins,
                available: g.lookup_size.saturating_sub(bins),
                total: g.lookup_size,
            },
            flow: UsageCount {
                used: state.tedata.used_by_group(group),
                available: state.tedata.free_count(),
                total: state.tedata.capacity(),
            },
            count: UsageCount {
                used: g.counters(),
                available: state.counters.available(),
                total: state.counters.total(),
            },
        })
    }

    pub(crate) fn te_data_usage(&self, engine: EngineId) -> Result<TeDataUsage, TunnelError> {
        let tedata = &self.engine(engine)?.tedata;
        Ok(TeDataUsage {
            size: tedata.size(),
            free: tedata.free_count(),
            first_free: tedata.first_free(),
            swap_base: tedata.swap_base(),
            swap_size: tedata.swap_size(),
            largest_block: tedata.largest_block(),
        })
    }

    pub(crate) fn dump_te_data(&self, engine: EngineId) -> Result<String, TunnelError> {
        Ok(self.engine(engine)?.tedata.to_string())
    }

    /// Check that the allocator of `engine` owns exactly the blocks the groups think they own
    fn check_owner(&self, engine: EngineId, block: BlockRef, owner: &BlockCtrl) -> Result<(), TunnelError> {
        let ctrl = self.engine(engine)?.tedata.block_at(block.start)?;
        if ctrl.length != block.length
            || ctrl.group != owner.group
            || ctrl.kind != owner.kind
            || ctrl.entry != owner.entry
        {
            return Err(TunnelError::internal(format!(
                "engine {engine}: block at {block} is owned by {} {} of group {}, not by {} {} of group {}",
                ctrl.kind, ctrl.entry, ctrl.group, owner.kind, owner.entry, owner.group
            )));
        }
        Ok(())
    }

    fn read_slots(&mut self, engine: EngineId, block: BlockRef) -> Result<Vec<Slot>, TunnelError> {
        let mut words = vec![0u32; block.length as usize * TE_DATA_WIDTH];
        self.hal.read_block(&TE_DATA, block.start, engine, &mut words)?;
        Ok(from_words(&words))
    }

    /// Cross-check the allocator, the bookkeeping and the hardware of `engine`
    pub(crate) fn validate(&mut self, engine: EngineId) -> Result<(), TunnelError> {
        self.engine(engine)?.tedata.validate()?;
        let mut bins = Vec::new();
        let mut flows = Vec::new();
        for group in self.groups.values().filter(|g| g.params.engine == engine) {
            for bin in group.bins.values() {
                let Some(block) = bin.block else {
                    return Err(TunnelError::internal(format!(
                        "bin {} of group {} has no block",
                        bin.index, group.id
                    )));
                };
                let mut ptrs = Vec::with_capacity(bin.flow_ptrs.len());
                for (flow_id, offset) in &bin.flow_ptrs {
                    let flow = group.encap_flows.get(flow_id).ok_or_else(|| {
                        TunnelError::internal(format!(
                            "group {} bin {}: points to missing encap flow {flow_id}",
                            group.id, bin.index
                        ))
                    })?;
                    let expected: Vec<Slot> = flow
                        .block
                        .iter()
                        .chain(&flow.retired)
                        .map(|b| flow_ptr_slot(FlowPtr::from(*b)))
                        .collect();
                    ptrs.push((*flow_id, *offset, expected));
                }
                bins.push(BinCheck {
                    group: group.id,
                    bin: bin.index,
                    index: group.lookup_index(bin.index),
                    block,
                    rules: bin.rules.len(),
                    ptrs,
                });
            }
            for flow in group.encap_flows.values() {
                for block in flow.block.iter().chain(&flow.retired) {
                    flows.push((group.id, flow.id, *block));
                }
            }
        }
        for check in bins {
            let BinCheck {
                group,
                bin,
                index,
                block,
                rules,
                ptrs,
            } = check;
            self.check_owner(engine, block, &BlockCtrl::new(group, BlockKind::RuleBin, bin))?;
            let entry = self.hal.get_lookup_entry(engine, index)?;
            if entry != lookup_entry(block)? {
                return Err(TunnelError::internal(format!(
                    "group {group} bin {bin}: lookup entry {entry} does not point at {block}"
                )));
            }
            let slots = self.read_slots(engine, block)?;
            let records = decode_block(&slots)?.len();
            if records < rules {
                return Err(TunnelError::internal(format!(
                    "group {group} bin {bin}: {records} records for {rules} rules"
                )));
            }
            for (flow, offset, expected) in ptrs {
                let found = slots.get(offset as usize).copied();
                if !found.is_some_and(|slot| expected.contains(&slot)) {
                    return Err(TunnelError::internal(format!(
                        "group {group} bin {bin}: flow pointer at offset {offset} is {found:x?}, \
                         not the block of encap flow {flow}"
                    )));
                }
            }
        }
        for (group, flow, block) in flows {
            self.check_owner(engine, block, &BlockCtrl::new(group, BlockKind::SharedEncapFlow, flow))?;
            decode_block(&self.read_slots(engine, block)?)?;
        }
        Ok(())
    }
}
