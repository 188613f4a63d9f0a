// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Encoding of rules and of the blocks of lookup bins

use std::collections::BTreeMap;
#[allow(unused)]
use tracing::{debug, warn};

use crate::codec::encap::{check_extensions, check_values};
use crate::codec::{DecapRecord, EncapRecord, FlowKeyRecord, Slot, TeRecord, serialize};
use crate::errors::TunnelError;
use crate::model::flow::{EncapField, EncapFlow, EncapValues, FlowPtr};
use crate::model::group::TunnelGroupParams;
use crate::model::rule::{ConditionParams, Rule, RuleAction, RuleActionParams, TunnelCondition};
use crate::types::{FlowId, LookupType, RuleId, check_vni};

/// Resolves the encap flows referenced by rules
pub trait FlowLookup {
    fn flow(&self, id: FlowId) -> Option<&EncapFlow>;
}

impl FlowLookup for BTreeMap<FlowId, EncapFlow> {
    fn flow(&self, id: FlowId) -> Option<&EncapFlow> {
        self.get(&id)
    }
}

/// The flows of a group, with one of them replaced by a candidate definition
pub(crate) struct FlowOverride<'a> {
    pub(crate) flows: &'a BTreeMap<FlowId, EncapFlow>,
    pub(crate) flow: &'a EncapFlow,
}

impl FlowLookup for FlowOverride<'_> {
    fn flow(&self, id: FlowId) -> Option<&EncapFlow> {
        if id == self.flow.id {
            Some(self.flow)
        } else {
            self.flows.get(&id)
        }
    }
}

/// Check the match condition of a rule of a hash group
pub fn validate_condition(
    condition: TunnelCondition,
    params: &ConditionParams,
) -> Result<(), TunnelError> {
    if condition.is_empty() {
        return Err(TunnelError::InvalidArgument(
            "hash rules need a match condition",
        ));
    }
    if condition.contains(TunnelCondition::UDP | TunnelCondition::TCP) {
        return Err(TunnelError::TunnelConflict(
            "UDP and TCP matches are mutually exclusive",
        ));
    }
    if condition.contains(TunnelCondition::PROT)
        && condition.intersects(TunnelCondition::UDP | TunnelCondition::TCP)
    {
        return Err(TunnelError::TunnelConflict(
            "protocol match conflicts with UDP/TCP match",
        ));
    }
    if condition.contains(TunnelCondition::VNI) {
        check_vni(params.vni)?;
    }
    Ok(())
}

/// Check the action of a rule against the kind of its group
pub fn validate_action(group: &TunnelGroupParams, action: RuleAction) -> Result<(), TunnelError> {
    if group.encap {
        if !action.contains(RuleAction::ENCAP_FLOW) {
            return Err(TunnelError::InvalidArgument(
                "encap rules must use an encap flow",
            ));
        }
        if !RuleAction::ENCAP.contains(action) {
            return Err(TunnelError::TunnelConflict("decap action in an encap group"));
        }
    } else if !RuleAction::DECAP.contains(action) {
        return Err(TunnelError::TunnelConflict("encap action in a decap group"));
    }
    Ok(())
}

fn counter_of(rule: &Rule) -> Result<u32, TunnelError> {
    rule.counter
        .ok_or_else(|| TunnelError::internal(format!("counter of rule {} not reserved", rule.id)))
}

fn decap_record(rule: &Rule) -> Result<DecapRecord, TunnelError> {
    let fields = rule.action;
    let p = &rule.action_params;
    if fields.contains(RuleAction::SET_DIP | RuleAction::SET_SIP)
        && p.dip.is_ipv6() != p.sip.is_ipv6()
    {
        return Err(TunnelError::TunnelConflict(
            "DIP and SIP of different address families",
        ));
    }
    let mut params = RuleActionParams::default();
    let keep = |f: RuleAction| fields.contains(f);
    if keep(RuleAction::SET_DGLORT) {
        params.dglort = p.dglort;
    }
    if keep(RuleAction::SET_SGLORT) {
        params.sglort = p.sglort;
    }
    if keep(RuleAction::SET_DMAC) {
        params.dmac = p.dmac;
    }
    if keep(RuleAction::SET_SMAC) {
        params.smac = p.smac;
    }
    if keep(RuleAction::SET_VLAN) {
        params.vlan = p.vlan;
    }
    if keep(RuleAction::SET_DIP) {
        params.dip = p.dip;
    }
    if keep(RuleAction::SET_SIP) {
        params.sip = p.sip;
    }
    if keep(RuleAction::SET_L4SRC) {
        params.l4_src = p.l4_src;
    }
    if keep(RuleAction::SET_L4DST) {
        params.l4_dst = p.l4_dst;
    }
    if keep(RuleAction::SET_TTL) {
        params.ttl = p.ttl;
    }
    let counter = if keep(RuleAction::COUNTER) {
        counter_of(rule)?
    } else {
        0
    };
    Ok(DecapRecord {
        fields,
        params,
        counter,
    })
}

/// Apply the overrides of an encap rule to encap values
fn apply_overrides(
    rule: &Rule,
    overrides: EncapField,
    fields: EncapField,
    values: &mut EncapValues,
) -> Result<(), TunnelError> {
    let p = &rule.action_params;
    if overrides.contains(EncapField::VNI) {
        values.vni = check_vni(p.vni)?;
    }
    if overrides.contains(EncapField::DMAC) {
        values.dmac = p.dmac;
    }
    if overrides.contains(EncapField::SMAC) {
        values.smac = p.smac;
    }
    if overrides.contains(EncapField::VLAN) {
        values.vlan = p.vlan;
    }
    if overrides.contains(EncapField::COUNTER) {
        values.counter = counter_of(rule)?;
    }
    if overrides.contains(EncapField::NGE) {
        if p.nge.mask == 0 {
            return Err(TunnelError::InvalidArgument("NGE header without words"));
        }
        values.nge = if fields.contains(EncapField::NGE) {
            values.nge.merged(&p.nge)
        } else {
            p.nge.clone()
        };
    }
    if overrides.contains(EncapField::GPE_NEXT_PROT) {
        values.gpe_next_prot = p.gpe_next_prot;
    }
    if overrides.contains(EncapField::NSH_BASE_HDR) {
        values.nsh.base_hdr = p.nsh.base_hdr;
    }
    if overrides.contains(EncapField::NSH_SERVICE_HDR) {
        values.nsh.service_hdr = p.nsh.service_hdr;
    }
    if overrides.contains(EncapField::NSH_DATA) {
        values.nsh.metadata.clone_from(&p.nsh.metadata);
    }
    Ok(())
}

fn encap_record(
    group: &TunnelGroupParams,
    rule: &Rule,
    flows: &dyn FlowLookup,
) -> Result<EncapRecord, TunnelError> {
    let flow_id = rule.action_params.encap_flow;
    let flow = flows
        .flow(flow_id)
        .ok_or(TunnelError::NoEncapFlow(flow_id))?;
    let overrides = rule.action.encap_overrides();
    check_extensions(group.tunnel_type, overrides | flow.params.action)?;

    if flow.is_shared() {
        let block = flow.block.ok_or_else(|| {
            TunnelError::internal(format!("shared encap flow {flow_id} has no block"))
        })?;
        let fields = overrides | EncapField::FLOW_PTR;
        let mut values = EncapValues {
            flow_ptr: FlowPtr::from(block),
            ..Default::default()
        };
        apply_overrides(rule, overrides, EncapField::empty(), &mut values)?;
        check_values(fields, &values)?;
        return Ok(EncapRecord {
            fields,
            values: values.masked(fields),
        });
    }

    let flow_fields = flow.params.action;
    let mut values = flow.params.values.clone();
    if flow_fields.contains(EncapField::COUNTER) {
        values.counter = flow.counter.ok_or_else(|| {
            TunnelError::internal(format!("counter of encap flow {flow_id} not reserved"))
        })?;
    }
    apply_overrides(rule, overrides, flow_fields, &mut values)?;
    let fields = flow_fields | overrides;
    check_values(fields, &values)?;
    Ok(EncapRecord {
        fields,
        values: values.masked(fields),
    })
}

/// The records of a rule: the match key for hash groups, then the data record
pub fn encode_rule(
    group: &TunnelGroupParams,
    rule: &Rule,
    flows: &dyn FlowLookup,
) -> Result<Vec<TeRecord>, TunnelError> {
    validate_action(group, rule.action)?;
    let mut records = Vec::with_capacity(2);
    if group.lookup == LookupType::Hash {
        validate_condition(rule.condition, &rule.cond_params)?;
        records.push(TeRecord::FlowKey(FlowKeyRecord {
            condition: rule.condition,
            params: masked_condition(rule.condition, &rule.cond_params),
        }));
    }
    if group.encap {
        records.push(TeRecord::Encap(encap_record(group, rule, flows)?));
    } else {
        records.push(TeRecord::Decap(decap_record(rule)?));
    }
    Ok(records)
}

/// A copy of the match values with the fields absent from `condition` reset
#[must_use]
pub fn masked_condition(condition: TunnelCondition, p: &ConditionParams) -> ConditionParams {
    let d = ConditionParams::default();
    let keep = |c: TunnelCondition| condition.contains(c);
    ConditionParams {
        vsi_tep: if keep(TunnelCondition::VSI_TEP) { p.vsi_tep } else { d.vsi_tep },
        vni: if keep(TunnelCondition::VNI) { p.vni } else { d.vni },
        dmac: if keep(TunnelCondition::DMAC) { p.dmac } else { d.dmac },
        smac: if keep(TunnelCondition::SMAC) { p.smac } else { d.smac },
        vlan: if keep(TunnelCondition::VLAN) { p.vlan } else { d.vlan },
        dip: if keep(TunnelCondition::DIP) { p.dip } else { d.dip },
        sip: if keep(TunnelCondition::SIP) { p.sip } else { d.sip },
        l4_src: if keep(TunnelCondition::L4SRC) { p.l4_src } else { d.l4_src },
        l4_dst: if keep(TunnelCondition::L4DST) { p.l4_dst } else { d.l4_dst },
        protocol: if keep(TunnelCondition::PROT) { p.protocol } else { d.protocol },
    }
}

/// The encoded block of a lookup bin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBin {
    pub slots: Vec<Slot>,
    /// Offset of the first record of each rule
    pub rule_offsets: Vec<(RuleId, u32)>,
    /// Offset of each slot pointing to a shared flow
    pub flow_ptrs: Vec<(FlowId, u32)>,
}

impl EncodedBin {
    #[must_use]
    pub fn len(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

fn offset(slots: usize) -> u32 {
    u32::try_from(slots).unwrap_or(u32::MAX)
}

/// Encode the rules of a bin into one block, in ascending rule id order
pub fn encode_bin<'a>(
    group: &TunnelGroupParams,
    bin: u32,
    rules: impl IntoIterator<Item = &'a Rule>,
    flows: &dyn FlowLookup,
    max_length: u32,
) -> Result<EncodedBin, TunnelError> {
    let mut rules: Vec<&Rule> = rules.into_iter().collect();
    rules.sort_by_key(|r| r.id);
    let mut records = Vec::with_capacity(rules.len() * 2);
    let mut rule_offsets = Vec::with_capacity(rules.len());
    let mut flow_ptrs = Vec::new();
    let mut at = 0usize;
    for rule in rules {
        rule_offsets.push((rule.id, offset(at)));
        for record in encode_rule(group, rule, flows)? {
            if let TeRecord::Encap(encap) = &record
                && let Some(ptr) = encap.flow_ptr_offset()
            {
                flow_ptrs.push((rule.action_params.encap_flow, offset(at + ptr)));
            }
            at += record.slot_count();
            records.push(record);
        }
    }
    if at > max_length as usize {
        debug!("bin {bin}: {at} slots, more than {max_length}");
        return Err(TunnelError::BinFull {
            bin,
            max: max_length,
        });
    }
    Ok(EncodedBin {
        slots: serialize(&records),
        rule_offsets,
        flow_ptrs,
    })
}
