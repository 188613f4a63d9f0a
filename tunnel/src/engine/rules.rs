// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Rules of tunnel groups

use hal::TeHal;
#[allow(unused)]
use tracing::{debug, info, warn};

use super::TunnelState;
use super::update::desync;
use crate::codec::hash::pack_hash_key;
use crate::codec::rule::{encode_bin, validate_action};
use crate::errors::TunnelError;
use crate::model::bin::LookupBin;
use crate::model::group::TunnelGroup;
use crate::model::rule::{ConditionParams, Rule, RuleAction, RuleActionParams, TunnelCondition};
use crate::types::{GroupId, RuleId};

/// Check that `candidate` can join its bin: the encoding succeeds, no other rule of the bin
/// has the same match key, and the block of the bin stays within `max_length` slots.
fn check_rule(group: &TunnelGroup, candidate: &Rule, max_length: u32) -> Result<(), TunnelError> {
    validate_action(&group.params, candidate.action)?;
    if let Some(flow) = candidate.encap_flow()
        && !group.encap_flows.contains_key(&flow)
    {
        return Err(TunnelError::NoEncapFlow(flow));
    }
    let others: Vec<&Rule> = group
        .bins
        .get(&candidate.lookup_bin)
        .map(|bin| {
            bin.rules
                .iter()
                .filter(|id| **id != candidate.id)
                .filter_map(|id| group.rules.get(id))
                .collect()
        })
        .unwrap_or_default();
    if !group.is_direct() {
        let key = pack_hash_key(candidate.condition, &candidate.cond_params);
        if others.iter().any(|other| {
            other.condition == candidate.condition
                && pack_hash_key(other.condition, &other.cond_params) == key
        }) {
            return Err(TunnelError::TunnelConflict(
                "a rule with the same match key exists",
            ));
        }
    }
    encode_bin(
        &group.params,
        candidate.lookup_bin,
        others.into_iter().chain(std::iter::once(candidate)),
        &group.encap_flows,
        max_length,
    )?;
    Ok(())
}

impl<H: TeHal> TunnelState<H> {
    /// Insert a rule in the bookkeeping, without touching the hardware
    fn link_rule(&mut self, group_id: GroupId, mut rule: Rule) -> Result<(), TunnelError> {
        let group = self.group_mut(group_id)?;
        let (id, bin) = (rule.id, rule.lookup_bin);
        if let Some(flow) = rule.encap_flow() {
            group
                .encap_flows
                .get_mut(&flow)
                .ok_or(TunnelError::NoEncapFlow(flow))?
                .rules
                .insert(id);
        }
        let lookup_bin = group.bins.entry(bin).or_insert_with(|| LookupBin::new(bin));
        lookup_bin.rules.insert(id);
        // a rule put back in a bin it left
        if let Some(block) = lookup_bin.block
            && let Some((_, offset)) = lookup_bin.rule_offsets.iter().find(|(r, _)| *r == id)
        {
            rule.data_pos = block.start + offset;
        }
        if let Some(pool) = group.direct.as_mut() {
            pool.take(id);
        }
        group.rules.insert(id, rule);
        Ok(())
    }

    /// Remove a rule from the bookkeeping, without touching the hardware.
    /// A bin left empty is dropped only if it has no block yet.
    fn unlink_rule(&mut self, group_id: GroupId, rule_id: RuleId) -> Result<Rule, TunnelError> {
        let group = self.group_mut(group_id)?;
        let rule = group
            .rules
            .remove(&rule_id)
            .ok_or(TunnelError::NoSuchRule(group_id, rule_id))?;
        let drop_bin = group.bins.get_mut(&rule.lookup_bin).is_some_and(|bin| {
            bin.rules.remove(&rule_id);
            bin.rules.is_empty() && bin.block.is_none()
        });
        if drop_bin {
            group.bins.remove(&rule.lookup_bin);
        }
        if let Some(flow) = rule.encap_flow()
            && let Some(flow) = group.encap_flows.get_mut(&flow)
        {
            flow.rules.remove(&rule_id);
        }
        if let Some(pool) = group.direct.as_mut() {
            pool.release(rule_id);
        }
        Ok(rule)
    }

    #[allow(clippy::too_many_arguments)]
    fn candidate_rule(
        &self,
        group_id: GroupId,
        rule_id: RuleId,
        condition: TunnelCondition,
        cond_params: &ConditionParams,
        action: RuleAction,
        action_params: &RuleActionParams,
        counter: Option<u32>,
    ) -> Result<Rule, TunnelError> {
        let group = self.group(group_id)?;
        let rule = Rule {
            id: rule_id,
            condition,
            cond_params: cond_params.clone(),
            action,
            action_params: action_params.clone(),
            counter,
            lookup_bin: group.bin_for(rule_id, condition, cond_params),
            data_pos: 0,
        };
        check_rule(group, &rule, self.config.max_block_length)?;
        Ok(rule)
    }

    pub(crate) fn add_rule(
        &mut self,
        group_id: GroupId,
        rule_id: RuleId,
        condition: TunnelCondition,
        cond_params: &ConditionParams,
        action: RuleAction,
        action_params: &RuleActionParams,
    ) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        if group.rules.contains_key(&rule_id) {
            return Err(TunnelError::InvalidEntry("rule already exists"));
        }
        if group.is_direct() && rule_id >= group.lookup_size {
            return Err(TunnelError::InvalidEntry(
                "rule id beyond the size of the direct lookup group",
            ));
        }
        let with_counter = action.contains(RuleAction::COUNTER);
        let mut rule = self.candidate_rule(
            group_id,
            rule_id,
            condition,
            cond_params,
            action,
            action_params,
            with_counter.then_some(0),
        )?;
        let bin = rule.lookup_bin;

        rule.counter = if with_counter {
            Some(self.reserve_counter(engine)?)
        } else {
            None
        };
        let counter = rule.counter;
        if let Err(e) = self
            .link_rule(group_id, rule)
            .and_then(|()| self.commit_bin(group_id, bin))
        {
            if e.is_clean() {
                // the rule may not have been linked
                self.unlink_rule(group_id, rule_id).ok();
                if let Some(counter) = counter {
                    self.release_counter(engine, counter);
                }
            }
            return Err(e);
        }
        debug!("group {group_id}: added rule {rule_id} in bin {bin}");
        Ok(())
    }

    pub(crate) fn update_rule(
        &mut self,
        group_id: GroupId,
        rule_id: RuleId,
        condition: TunnelCondition,
        cond_params: &ConditionParams,
        action: RuleAction,
        action_params: &RuleActionParams,
    ) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        let old = group
            .rules
            .get(&rule_id)
            .ok_or(TunnelError::NoSuchRule(group_id, rule_id))?
            .clone();
        let with_counter = action.contains(RuleAction::COUNTER);
        let mut rule = self.candidate_rule(
            group_id,
            rule_id,
            condition,
            cond_params,
            action,
            action_params,
            if with_counter { old.counter.or(Some(0)) } else { None },
        )?;
        rule.data_pos = old.data_pos;
        let (new_bin, old_bin) = (rule.lookup_bin, old.lookup_bin);

        rule.counter = match (with_counter, old.counter) {
            (true, None) => Some(self.reserve_counter(engine)?),
            (true, Some(counter)) => Some(counter),
            (false, _) => None,
        };
        let counter = rule.counter;
        self.unlink_rule(group_id, rule_id)?;
        if let Err(e) = self
            .link_rule(group_id, rule)
            .and_then(|()| self.commit_bin(group_id, new_bin))
        {
            if e.is_clean() {
                self.unlink_rule(group_id, rule_id).ok();
                self.link_rule(group_id, old.clone())?;
                if old.counter.is_none()
                    && let Some(counter) = counter
                {
                    self.release_counter(engine, counter);
                }
            }
            return Err(e);
        }
        if old_bin != new_bin {
            self.commit_bin(group_id, old_bin).map_err(desync)?;
        }
        if let Some(old_counter) = old.counter
            && counter.is_none()
        {
            self.release_counter(engine, old_counter);
        }
        debug!("group {group_id}: updated rule {rule_id}, bin {old_bin} -> {new_bin}");
        Ok(())
    }

    pub(crate) fn delete_rule(&mut self, group_id: GroupId, rule_id: RuleId) -> Result<(), TunnelError> {
        let group = self.group(group_id)?;
        let engine = group.params.engine;
        if !group.rules.contains_key(&rule_id) {
            return Err(TunnelError::NoSuchRule(group_id, rule_id));
        }
        let rule = self.unlink_rule(group_id, rule_id)?;
        let bin = rule.lookup_bin;
        let exists = self.group(group_id)?.bins.contains_key(&bin);
        if exists && let Err(e) = self.commit_bin(group_id, bin) {
            if e.is_clean() {
                self.link_rule(group_id, rule)?;
            }
            return Err(e);
        }
        if let Some(counter) = rule.counter {
            self.release_counter(engine, counter);
        }
        debug!("group {group_id}: deleted rule {rule_id} from bin {bin}");
        Ok(())
    }
}
