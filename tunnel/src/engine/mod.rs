// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! State of the tunnel table manager and the operations on it.
//!
//! Every operation validates its arguments and reserves the resources it needs before the
//! first hardware write. Resource exhaustion and argument errors therefore leave hardware and
//! bookkeeping unchanged.

mod flows;
mod groups;
mod query;
mod rules;
mod update;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test;

use std::collections::BTreeMap;
use tracectl::trace_target;
#[allow(unused)]
use tracing::{debug, error, info, warn};

use crate::alloc::TeDataTable;
use crate::config::TunnelConfig;
use crate::errors::TunnelError;
use crate::model::group::TunnelGroup;
use crate::pool::IndexPool;
use crate::types::{EngineId, GroupId};
use hal::{FlowCounter, TeHal};

trace_target!("tunnel-mgr", LevelFilter::INFO, &["tunnel"]);

/// State of one tunneling engine
#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) id: EngineId,
    pub(crate) tedata: TeDataTable,
    pub(crate) counters: IndexPool,
    /// Group occupying each group slot of the engine
    pub(crate) group_slots: Vec<Option<GroupId>>,
}

/// Everything the tunnel lock protects
#[derive(Debug)]
pub(crate) struct TunnelState<H: TeHal> {
    pub(crate) config: TunnelConfig,
    pub(crate) hal: H,
    pub(crate) engines: Vec<EngineState>,
    pub(crate) groups: BTreeMap<GroupId, TunnelGroup>,
    pub(crate) group_ids: IndexPool,
}

impl<H: TeHal> TunnelState<H> {
    pub(crate) fn new(config: TunnelConfig, hal: H) -> Result<Self, TunnelError> {
        config.validate()?;
        let engines = (0..config.engines)
            .map(|id| {
                Ok(EngineState {
                    id,
                    tedata: TeDataTable::new(
                        id,
                        config.te_data_size,
                        config.min_swap_size,
                        config.free_headroom,
                    )?,
                    counters: IndexPool::new(0, config.counters),
                    group_slots: vec![None; usize::from(config.groups_per_engine)],
                })
            })
            .collect::<Result<Vec<_>, TunnelError>>()?;
        Ok(Self {
            group_ids: IndexPool::new(0, config.max_groups),
            config,
            hal,
            engines,
            groups: BTreeMap::new(),
        })
    }

    pub(crate) fn engine(&self, engine: EngineId) -> Result<&EngineState, TunnelError> {
        self.engines
            .get(usize::from(engine))
            .ok_or(TunnelError::InvalidArgument("no such tunneling engine"))
    }

    pub(crate) fn engine_mut(&mut self, engine: EngineId) -> Result<&mut EngineState, TunnelError> {
        self.engines
            .get_mut(usize::from(engine))
            .ok_or(TunnelError::InvalidArgument("no such tunneling engine"))
    }

    pub(crate) fn group(&self, group: GroupId) -> Result<&TunnelGroup, TunnelError> {
        self.groups
            .get(&group)
            .ok_or(TunnelError::NoSuchGroup(group))
    }

    pub(crate) fn group_mut(&mut self, group: GroupId) -> Result<&mut TunnelGroup, TunnelError> {
        self.groups
            .get_mut(&group)
            .ok_or(TunnelError::NoSuchGroup(group))
    }

    /// Reserve a counter on `engine` and zero it
    pub(crate) fn reserve_counter(&mut self, engine: EngineId) -> Result<u32, TunnelError> {
        let state = self.engine_mut(engine)?;
        let counter = state
            .counters
            .take_first()
            .ok_or(TunnelError::CountFull(state.id))?;
        if let Err(e) = self
            .hal
            .set_flow_counter(engine, counter, FlowCounter::default())
        {
            self.release_counter(engine, counter);
            return Err(e.into());
        }
        debug!("engine {engine}: reserved counter {counter}");
        Ok(counter)
    }

    pub(crate) fn release_counter(&mut self, engine: EngineId, counter: u32) {
        match self
            .engine_mut(engine)
            .map(|state| state.counters.release(counter).then_some(state.id))
        {
            Ok(Some(id)) => debug!("engine {id}: released counter {counter}"),
            _ => warn!("engine {engine}: counter {counter} was not reserved"),
        }
    }

    /// Remove every object, dependents first
    pub(crate) fn teardown(&mut self) -> Result<(), TunnelError> {
        let groups: Vec<GroupId> = self.groups.keys().copied().collect();
        for group in groups {
            let rules: Vec<_> = self.group(group)?.rules.keys().copied().collect();
            for rule in rules {
                self.delete_rule(group, rule)?;
            }
            let flows: Vec<_> = self.group(group)?.encap_flows.keys().copied().collect();
            for flow in flows {
                self.delete_encap_flow(group, flow)?;
            }
            self.delete_group(group)?;
        }
        info!("tunnel state torn down");
        Ok(())
    }
}
