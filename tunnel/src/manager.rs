// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The tunnel table manager of a switch.
//!
//! [`TunnelManager`] owns the hardware access layer and all the tunnel bookkeeping behind one
//! lock, taken for the whole duration of every call.

use std::fmt::Display;
use std::sync::{Mutex, MutexGuard};
#[allow(unused)]
use tracing::{debug, error, info, warn};

use crate::config::TunnelConfig;
use crate::engine::TunnelState;
use crate::errors::TunnelError;
use crate::model::flow::{EncapFlow, EncapFlowParams};
use crate::model::group::{TunnelGroupInfo, TunnelGroupParams};
use crate::model::rule::{ConditionParams, Rule, RuleAction, RuleActionParams, TunnelCondition};
use crate::types::{EngineId, FlowId, GroupId, RuleId};
use hal::{FlowCounter, TeHal};

/// Used, available and total amounts of one resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCount {
    pub used: u32,
    pub available: u32,
    pub total: u32,
}

impl Display for UsageCount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} used, {} available", self.used, self.total, self.available)
    }
}

/// Resource usage of a tunnel group.
///
/// `lookup` counts the lookup bins of the group. `flow` counts the TE-Data slots of the group
/// against the free and total slots of its engine, and `count` does the same for counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelUsage {
    pub lookup: UsageCount,
    pub flow: UsageCount,
    pub count: UsageCount,
}

impl Display for TunnelUsage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lookup: {}; flow: {}; count: {}",
            self.lookup, self.flow, self.count
        )
    }
}

/// State of the TE-Data allocator of an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeDataUsage {
    pub size: u32,
    pub free: u32,
    pub first_free: u32,
    pub swap_base: u32,
    pub swap_size: u32,
    pub largest_block: u32,
}

pub struct TunnelManager<H: TeHal> {
    state: Mutex<TunnelState<H>>,
}

impl<H: TeHal> TunnelManager<H> {
    /// Create the manager of a switch whose tunneling engines are reached through `hal`
    pub fn init(config: TunnelConfig, hal: H) -> Result<Self, TunnelError> {
        info!("initializing tunnel manager: {config}");
        let state = TunnelState::new(config, hal)?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    /// Remove every rule, encap flow and group, and hand the hardware access layer back
    pub fn teardown(self) -> Result<H, TunnelError> {
        let mut state = self
            .state
            .into_inner()
            .map_err(|_| TunnelError::internal("tunnel lock poisoned"))?;
        state.teardown()?;
        info!("tunnel manager torn down");
        let TunnelState { hal, .. } = state;
        Ok(hal)
    }

    fn lock(&self) -> Result<MutexGuard<'_, TunnelState<H>>, TunnelError> {
        self.state
            .lock()
            .map_err(|_| TunnelError::internal("tunnel lock poisoned"))
    }

    /// Run `f` on the hardware access layer, under the tunnel lock
    pub fn with_hal<R>(&self, f: impl FnOnce(&mut H) -> R) -> Result<R, TunnelError> {
        Ok(f(&mut self.lock()?.hal))
    }

    pub fn create_tunnel_group(&self, params: &TunnelGroupParams) -> Result<GroupId, TunnelError> {
        self.lock()?.create_group(params)
    }

    pub fn delete_tunnel_group(&self, group: GroupId) -> Result<(), TunnelError> {
        self.lock()?.delete_group(group)
    }

    pub fn get_tunnel_group(&self, group: GroupId) -> Result<TunnelGroupInfo, TunnelError> {
        self.lock()?.group_info(group)
    }

    pub fn get_tunnel_group_first(&self) -> Result<Option<TunnelGroupInfo>, TunnelError> {
        Ok(self.lock()?.group_after(None))
    }

    pub fn get_tunnel_group_next(&self, after: GroupId) -> Result<Option<TunnelGroupInfo>, TunnelError> {
        Ok(self.lock()?.group_after(Some(after)))
    }

    pub fn add_encap_flow(
        &self,
        group: GroupId,
        flow: FlowId,
        params: &EncapFlowParams,
    ) -> Result<(), TunnelError> {
        self.lock()?.add_encap_flow(group, flow, params)
    }

    /// Change the definition of an encap flow. Every rule using it is re-installed.
    pub fn update_encap_flow(
        &self,
        group: GroupId,
        flow: FlowId,
        params: &EncapFlowParams,
    ) -> Result<(), TunnelError> {
        self.lock()?.update_encap_flow(group, flow, params)
    }

    pub fn delete_encap_flow(&self, group: GroupId, flow: FlowId) -> Result<(), TunnelError> {
        self.lock()?.delete_encap_flow(group, flow)
    }

    pub fn get_encap_flow(&self, group: GroupId, flow: FlowId) -> Result<EncapFlow, TunnelError> {
        self.lock()?.flow(group, flow).cloned()
    }

    pub fn get_encap_flow_first(&self, group: GroupId) -> Result<Option<EncapFlow>, TunnelError> {
        self.lock()?.flow_after(group, None)
    }

    pub fn get_encap_flow_next(
        &self,
        group: GroupId,
        after: FlowId,
    ) -> Result<Option<EncapFlow>, TunnelError> {
        self.lock()?.flow_after(group, Some(after))
    }

    pub fn add_rule(
        &self,
        group: GroupId,
        rule: RuleId,
        condition: TunnelCondition,
        cond_params: &ConditionParams,
        action: RuleAction,
        action_params: &RuleActionParams,
    ) -> Result<(), TunnelError> {
        self.lock()?
            .add_rule(group, rule, condition, cond_params, action, action_params)
    }

    pub fn update_rule(
        &self,
        group: GroupId,
        rule: RuleId,
        condition: TunnelCondition,
        cond_params: &ConditionParams,
        action: RuleAction,
        action_params: &RuleActionParams,
    ) -> Result<(), TunnelError> {
        self.lock()?
            .update_rule(group, rule, condition, cond_params, action, action_params)
    }

    pub fn delete_rule(&self, group: GroupId, rule: RuleId) -> Result<(), TunnelError> {
        self.lock()?.delete_rule(group, rule)
    }

    pub fn get_rule(&self, group: GroupId, rule: RuleId) -> Result<Rule, TunnelError> {
        self.lock()?.rule(group, rule).cloned()
    }

    pub fn get_rule_first(&self, group: GroupId) -> Result<Option<Rule>, TunnelError> {
        self.lock()?.rule_after(group, None)
    }

    pub fn get_rule_next(&self, group: GroupId, after: RuleId) -> Result<Option<Rule>, TunnelError> {
        self.lock()?.rule_after(group, Some(after))
    }

    pub fn get_rule_counter(&self, group: GroupId, rule: RuleId) -> Result<FlowCounter, TunnelError> {
        self.lock()?.rule_counter(group, rule)
    }

    pub fn reset_rule_counter(&self, group: GroupId, rule: RuleId) -> Result<(), TunnelError> {
        self.lock()?.reset_rule_counter(group, rule)
    }

    pub fn get_encap_flow_counter(
        &self,
        group: GroupId,
        flow: FlowId,
    ) -> Result<FlowCounter, TunnelError> {
        self.lock()?.flow_counter(group, flow)
    }

    pub fn reset_encap_flow_counter(&self, group: GroupId, flow: FlowId) -> Result<(), TunnelError> {
        self.lock()?.reset_flow_counter(group, flow)
    }

    /// Whether traffic hit a rule of a direct lookup group since the bit was last reset
    pub fn get_rule_used_bit(&self, group: GroupId, rule: RuleId) -> Result<bool, TunnelError> {
        self.lock()?.rule_used(group, rule)
    }

    pub fn reset_rule_used_bit(&self, group: GroupId, rule: RuleId) -> Result<(), TunnelError> {
        self.lock()?.reset_rule_used(group, rule)
    }

    pub fn get_usage(&self, group: GroupId) -> Result<TunnelUsage, TunnelError> {
        self.lock()?.usage(group)
    }

    pub fn get_te_data_usage(&self, engine: EngineId) -> Result<TeDataUsage, TunnelError> {
        self.lock()?.te_data_usage(engine)
    }

    /// First rule id not in use in a direct lookup group, from the allocation cursor
    pub fn next_free_direct_index(&self, group: GroupId) -> Result<Option<RuleId>, TunnelError> {
        self.lock()?.next_free_direct_index(group)
    }

    /// A listing of the blocks of the TE-Data table of `engine`
    pub fn dump_te_data(&self, engine: EngineId) -> Result<String, TunnelError> {
        self.lock()?.dump_te_data(engine)
    }

    /// Check the allocator of `engine` against the bookkeeping and the hardware
    pub fn validate_te_data(&self, engine: EngineId) -> Result<(), TunnelError> {
        self.lock()?.validate(engine)
    }
}
