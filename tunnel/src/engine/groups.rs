// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Creation and deletion of tunnel groups

use hal::TeHal;
#[allow(unused)]
use tracing::{debug, info, warn};

use super::TunnelState;
use crate::errors::TunnelError;
use crate::model::group::{GlortRange, TunnelGroup, TunnelGroupParams, best_fit};
use crate::types::{GroupId, LookupType};

impl<H: TeHal> TunnelState<H> {
    /// Lookup base for a new group of `size` entries on `engine`
    fn place_lookup(&self, params: &TunnelGroupParams, size: u32) -> Result<u32, TunnelError> {
        let taken: Vec<(u32, u32)> = self
            .groups
            .values()
            .filter(|g| g.params.engine == params.engine)
            .map(|g| (g.lookup_base, g.lookup_size))
            .collect();
        best_fit(&taken, 0..self.config.lookup_size, size, 1).ok_or(TunnelError::LookupFull(size))
    }

    /// GLORT range for a new group matching `tep_size` GLORTs, aligned on its size
    fn place_glorts(&self, tep_size: u32) -> Result<GlortRange, TunnelError> {
        if tep_size == 0 || tep_size > self.config.glort_size {
            return Err(TunnelError::TepSize(tep_size));
        }
        let size = tep_size.next_power_of_two();
        let base = u32::from(self.config.glort_base);
        let taken: Vec<(u32, u32)> = self
            .groups
            .values()
            .map(|g| (u32::from(g.glort.base), g.glort.size))
            .collect();
        let start = best_fit(&taken, base..base + self.config.glort_size, size, size)
            .ok_or(TunnelError::GlortFull(size))?;
        Ok(GlortRange {
            base: u16::try_from(start).map_err(|_| TunnelError::GlortFull(size))?,
            size,
        })
    }

    pub(crate) fn create_group(&mut self, params: &TunnelGroupParams) -> Result<GroupId, TunnelError> {
        let engine = self.engine(params.engine)?;
        if params.size == 0 {
            return Err(TunnelError::InvalidArgument("empty tunnel group"));
        }
        let lookup_size = match params.lookup {
            LookupType::Hash => params
                .size
                .checked_next_power_of_two()
                .ok_or(TunnelError::LookupFull(params.size))?,
            LookupType::Direct => params.size,
        };
        let Some(slot) = engine.group_slots.iter().position(Option::is_none) else {
            return Err(TunnelError::GroupFull(params.engine));
        };
        let glort = self.place_glorts(params.tep_size)?;
        let lookup_base = self.place_lookup(params, lookup_size)?;
        let id = self.group_ids.take_first().ok_or(TunnelError::NoFreeGroup)?;

        let slot_index = u8::try_from(slot).map_err(|_| TunnelError::GroupFull(params.engine))?;
        self.engine_mut(params.engine)?.group_slots[slot] = Some(id);
        let group = TunnelGroup::new(id, slot_index, params.clone(), lookup_base, lookup_size, glort);
        info!("created tunnel {}", group.info());
        self.groups.insert(id, group);
        Ok(id)
    }

    pub(crate) fn delete_group(&mut self, id: GroupId) -> Result<(), TunnelError> {
        let group = self.group(id)?;
        if !group.is_empty() {
            return Err(TunnelError::InUse("tunnel group still has rules or encap flows"));
        }
        if !group.bins.is_empty() {
            return Err(TunnelError::internal(format!(
                "empty tunnel group {id} still has {} lookup bins",
                group.bins.len()
            )));
        }
        let (engine, slot) = (group.params.engine, usize::from(group.slot));
        self.engine_mut(engine)?.group_slots[slot] = None;
        self.groups.remove(&id);
        self.group_ids.release(id);
        self.hal.sync_lookup(engine)?;
        info!("deleted tunnel group {id}");
        Ok(())
    }
}
