// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Encap flows

use hal::{TE_DATA, TE_DATA_WIDTH, TeHal};
use std::collections::BTreeSet;
#[allow(unused)]
use tracing::{debug, info, warn};

use super::TunnelState;
use super::update::desync;
use crate::codec::encap::encode_encap_flow;
use crate::codec::rule::{FlowOverride, encode_bin};
use crate::codec::{flow_ptr_slot, from_words};
use crate::errors::TunnelError;
use crate::model::bin::BlockRef;
use crate::model::flow::{EncapField, EncapFlow, EncapFlowParams, FlowPtr};
use crate::types::{FlowId, GroupId};

impl<H: TeHal> TunnelState<H> {
    pub(crate) fn flow_mut(
        &mut self,
        group_id: GroupId,
        flow_id: FlowId,
    ) -> Result<&mut EncapFlow, TunnelError> {
        self.group_mut(group_id)?
            .encap_flows
            .get_mut(&flow_id)
            .ok_or(TunnelError::NoEncapFlow(flow_id))
    }

    pub(crate) fn add_encap_flow(
        &mut self,
        group_id: GroupId,
        flow_id: FlowId,
        params: &EncapFlowParams,
    ) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        if !group.params.encap {
            return Err(TunnelError::TunnelConflict(
                "encap flows require an encap tunnel group",
            ));
        }
        if group.encap_flows.contains_key(&flow_id) {
            return Err(TunnelError::InvalidEntry("encap flow already exists"));
        }
        let with_counter = params.action.contains(EncapField::COUNTER);
        encode_encap_flow(group.params.tunnel_type, params, with_counter.then_some(0))?;
        let engine = group.params.engine;

        let counter = if with_counter {
            Some(self.reserve_counter(engine)?)
        } else {
            None
        };
        let block = if params.shared {
            match self.install_flow_block(group_id, flow_id, params, counter) {
                Ok(block) => Some(block),
                Err(e) => {
                    if let Some(counter) = counter {
                        self.release_counter(engine, counter);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };
        let mut flow = EncapFlow::new(flow_id, params.clone(), counter);
        flow.block = block;
        self.group_mut(group_id)?.encap_flows.insert(flow_id, flow);
        info!("group {group_id}: added encap flow {flow_id}");
        Ok(())
    }

    /// Bins holding the rules that use a flow
    fn dependent_bins(&self, group_id: GroupId, flow_id: FlowId) -> Result<BTreeSet<u32>, TunnelError> {
        let group = self.group(group_id)?;
        let flow = group
            .encap_flows
            .get(&flow_id)
            .ok_or(TunnelError::NoEncapFlow(flow_id))?;
        Ok(flow
            .rules
            .iter()
            .filter_map(|r| group.rules.get(r))
            .map(|r| r.lookup_bin)
            .collect())
    }

    /// Check that every rule using the flow can still be encoded with the new definition
    fn check_dependents(
        &self,
        group_id: GroupId,
        candidate: &EncapFlow,
        bins: &BTreeSet<u32>,
    ) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let lookup = FlowOverride {
            flows: &group.encap_flows,
            flow: candidate,
        };
        for bin in bins {
            let Some(lookup_bin) = group.bins.get(bin) else {
                return Err(TunnelError::internal(format!(
                    "no bin {bin} in group {group_id}"
                )));
            };
            let rules = lookup_bin.rules.iter().filter_map(|r| group.rules.get(r));
            encode_bin(
                &group.params,
                *bin,
                rules,
                &lookup,
                self.config.max_block_length,
            )?;
        }
        Ok(())
    }

    pub(crate) fn update_encap_flow(
        &mut self,
        group_id: GroupId,
        flow_id: FlowId,
        params: &EncapFlowParams,
    ) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        let flow = group
            .encap_flows
            .get(&flow_id)
            .ok_or(TunnelError::NoEncapFlow(flow_id))?;
        if flow.params.shared != params.shared {
            return Err(TunnelError::InvalidArgument(
                "the shared attribute of an encap flow cannot change",
            ));
        }
        let with_counter = params.action.contains(EncapField::COUNTER);
        encode_encap_flow(group.params.tunnel_type, params, with_counter.then_some(0))?;
        let old_counter = flow.counter;
        let mut candidate = flow.clone();
        candidate.params = params.clone();
        candidate.counter = if with_counter {
            old_counter.or(Some(0))
        } else {
            None
        };
        let bins = self.dependent_bins(group_id, flow_id)?;
        self.check_dependents(group_id, &candidate, &bins)?;

        let counter = match (with_counter, old_counter) {
            (true, None) => Some(self.reserve_counter(engine)?),
            (true, Some(counter)) => Some(counter),
            (false, _) => None,
        };
        let result = if params.shared {
            self.update_shared_flow(group_id, flow_id, params, counter, &bins)
        } else {
            self.update_unshared_flow(group_id, flow_id, params, counter, &bins)
        };
        match result {
            Ok(()) => {
                if let Some(old) = old_counter
                    && counter.is_none()
                {
                    self.release_counter(engine, old);
                }
                info!("group {group_id}: updated encap flow {flow_id}");
                Ok(())
            }
            Err(e) => {
                if e.is_clean()
                    && old_counter.is_none()
                    && let Some(counter) = counter
                {
                    self.release_counter(engine, counter);
                }
                Err(e)
            }
        }
    }

    /// A new block is written for the flow, then the bins pointing at the flow are re-encoded
    /// to point at it; the old block is released last.
    fn update_shared_flow(
        &mut self,
        group_id: GroupId,
        flow_id: FlowId,
        params: &EncapFlowParams,
        counter: Option<u32>,
        bins: &BTreeSet<u32>,
    ) -> Result<(), TunnelError> {
        let engine = self.group(group_id)?.params.engine;
        let block = self.install_flow_block(group_id, flow_id, params, counter)?;
        let flow = self.flow_mut(group_id, flow_id)?;
        if let Some(old) = flow.block.replace(block) {
            flow.retired.push(old);
        }
        flow.params = params.clone();
        flow.counter = counter;

        let committed = self
            .commit_bins(group_id, bins.iter().copied())
            .and_then(|()| Ok(self.hal.sync_lookup(engine)?));
        if let Err(e) = committed {
            // blocks still pointed to stay retired until a later update or the deletion
            if let Err(release) = self.release_retired(group_id, flow_id) {
                warn!("group {group_id} encap flow {flow_id}: retired blocks kept: {release}");
            }
            return Err(desync(e));
        }
        self.release_retired(group_id, flow_id).map_err(desync)
    }

    /// Free the retired blocks of a shared flow that no installed bin points to anymore.
    /// The flow pointer slots are read back from the hardware.
    fn release_retired(&mut self, group_id: GroupId, flow_id: FlowId) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        let ptr_slots: Vec<u32> = group
            .bins
            .values()
            .filter(|bin| bin.points_to(flow_id))
            .filter_map(|bin| bin.block.map(|block| (block.start, bin)))
            .flat_map(|(start, bin)| {
                bin.flow_ptrs
                    .iter()
                    .filter(|(f, _)| *f == flow_id)
                    .map(move |(_, offset)| start + offset)
            })
            .collect();
        let mut pointed = Vec::with_capacity(ptr_slots.len());
        for slot in ptr_slots {
            let mut words = [0u32; TE_DATA_WIDTH];
            self.hal.read_block(&TE_DATA, slot, engine, &mut words)?;
            pointed.extend(from_words(&words));
        }

        let flow = self.flow_mut(group_id, flow_id)?;
        let (kept, released): (Vec<BlockRef>, Vec<BlockRef>) = flow
            .retired
            .drain(..)
            .partition(|b| pointed.contains(&flow_ptr_slot(FlowPtr::from(*b))));
        if !kept.is_empty() {
            warn!(
                "group {group_id} encap flow {flow_id}: {} retired blocks still in use",
                kept.len()
            );
        }
        flow.retired = kept;
        for block in released {
            self.engine_mut(engine)?
                .tedata
                .free(block.start, block.length)?;
            debug!("group {group_id} encap flow {flow_id}: released retired block {block}");
        }
        Ok(())
    }

    /// The definition is copied into every bin using the flow, so each of them is re-encoded
    fn update_unshared_flow(
        &mut self,
        group_id: GroupId,
        flow_id: FlowId,
        params: &EncapFlowParams,
        counter: Option<u32>,
        bins: &BTreeSet<u32>,
    ) -> Result<(), TunnelError> {
        let engine = self.group(group_id)?.params.engine;
        let flow = self.flow_mut(group_id, flow_id)?;
        let previous = (flow.params.clone(), flow.counter);
        flow.params = params.clone();
        flow.counter = counter;

        let mut bins = bins.iter().copied();
        if let Some(first) = bins.next()
            && let Err(e) = self.commit_bin(group_id, first)
        {
            if e.is_clean() {
                let flow = self.flow_mut(group_id, flow_id)?;
                (flow.params, flow.counter) = previous;
            }
            return Err(e);
        }
        self.commit_bins(group_id, bins).map_err(desync)?;
        self.hal.sync_lookup(engine).map_err(|e| desync(e.into()))
    }

    pub(crate) fn delete_encap_flow(
        &mut self,
        group_id: GroupId,
        flow_id: FlowId,
    ) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        let flow = group
            .encap_flows
            .get(&flow_id)
            .ok_or(TunnelError::NoEncapFlow(flow_id))?;
        if !flow.rules.is_empty() {
            return Err(TunnelError::InUse("encap flow still used by rules"));
        }
        let blocks: Vec<BlockRef> = flow.block.iter().chain(&flow.retired).copied().collect();
        for block in blocks {
            self.engine_mut(engine)?
                .tedata
                .free(block.start, block.length)?;
        }
        if let Some(flow) = self.group_mut(group_id)?.encap_flows.remove(&flow_id)
            && let Some(counter) = flow.counter
        {
            self.release_counter(engine, counter);
        }
        info!("group {group_id}: deleted encap flow {flow_id}");
        Ok(())
    }
}
