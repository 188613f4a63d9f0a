// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tunnel groups: a partition of the lookup table of an engine and its GLORT match range

use derive_builder::Builder;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::Range;

use crate::codec::hash::compute_hash_key;
use crate::model::bin::LookupBin;
use crate::model::flow::EncapFlow;
use crate::model::rule::{ConditionParams, Rule, TunnelCondition};
use crate::pool::IndexPool;
use crate::types::{EngineId, FlowId, GroupId, LookupType, RuleId, TunnelType};

/// What the caller gives to create a tunnel group
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
pub struct TunnelGroupParams {
    #[builder(default = 0)]
    pub engine: EngineId,

    #[builder(default)]
    pub lookup: LookupType,

    /// Number of lookup entries. Rounded up to a power of two for hash groups.
    pub size: u32,

    /// Whether the group encapsulates (encap flows and encap rules) or decapsulates
    #[builder(default = false)]
    pub encap: bool,

    #[builder(default)]
    pub tunnel_type: TunnelType,

    /// Number of GLORTs matched by the group
    #[builder(default = 1)]
    pub tep_size: u32,

    #[builder(default = 0)]
    pub user_value: u8,

    #[builder(default = 0)]
    pub user_mask: u8,
}

/// A range of GLORTs, matched as a value and a mask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlortRange {
    pub base: u16,
    pub size: u32,
}

impl GlortRange {
    #[must_use]
    pub fn value(&self) -> u16 {
        self.base
    }

    /// Mask of the bits shared by every GLORT of the range. `size` is a power of two.
    #[must_use]
    pub fn mask(&self) -> u16 {
        !u16::try_from(self.size - 1).unwrap_or(u16::MAX)
    }

    #[must_use]
    pub fn contains(&self, glort: u16) -> bool {
        glort & self.mask() == self.base
    }
}

/// Best fit: the start of the smallest gap of `space` not covered by `taken`
/// that can hold `size` entries at a multiple of `align`, the lowest one on ties.
pub(crate) fn best_fit(
    taken: &[(u32, u32)],
    space: Range<u32>,
    size: u32,
    align: u32,
) -> Option<u32> {
    let mut ranges = taken.to_vec();
    ranges.sort_unstable();
    let mut best: Option<(u32, u32)> = None;
    let mut consider = |gap_start: u32, gap_end: u32| {
        let start = gap_start.next_multiple_of(align);
        if start >= gap_end || gap_end - start < size {
            return;
        }
        let gap = gap_end - gap_start;
        if best.is_none_or(|(g, _)| gap < g) {
            best = Some((gap, start));
        }
    };
    let mut cursor = space.start;
    for (start, len) in ranges {
        if start > cursor {
            consider(cursor, start.min(space.end));
        }
        cursor = cursor.max(start + len);
    }
    if cursor < space.end {
        consider(cursor, space.end);
    }
    best.map(|(_, start)| start)
}

/// Summary of a tunnel group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelGroupInfo {
    pub id: GroupId,
    pub params: TunnelGroupParams,
    pub lookup_base: u32,
    pub lookup_size: u32,
    pub glort: GlortRange,
    pub rules: usize,
    pub encap_flows: usize,
    pub bins: usize,
}

impl Display for TunnelGroupInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "group {} engine {} {} {} lookup {}+{} glort {:#06x}/{:#06x} user {:#04x}/{:#04x}: {} rules, {} flows, {} bins",
            self.id,
            self.params.engine,
            self.params.lookup,
            if self.params.encap { "encap" } else { "decap" },
            self.lookup_base,
            self.lookup_size,
            self.glort.value(),
            self.glort.mask(),
            self.params.user_value,
            self.params.user_mask,
            self.rules,
            self.encap_flows,
            self.bins
        )
    }
}

/// A tunnel group and all the objects it owns
#[derive(Debug, Clone)]
pub struct TunnelGroup {
    pub id: GroupId,
    /// Slot of the group in its engine
    pub slot: u8,
    pub params: TunnelGroupParams,
    pub lookup_base: u32,
    pub lookup_size: u32,
    pub glort: GlortRange,
    pub rules: BTreeMap<RuleId, Rule>,
    pub encap_flows: BTreeMap<FlowId, EncapFlow>,
    pub bins: BTreeMap<u32, LookupBin>,
    /// Free lookup indexes of a direct group
    pub(crate) direct: Option<IndexPool>,
}

impl TunnelGroup {
    pub(crate) fn new(
        id: GroupId,
        slot: u8,
        params: TunnelGroupParams,
        lookup_base: u32,
        lookup_size: u32,
        glort: GlortRange,
    ) -> Self {
        let direct =
            (params.lookup == LookupType::Direct).then(|| IndexPool::new(0, lookup_size));
        Self {
            id,
            slot,
            params,
            lookup_base,
            lookup_size,
            glort,
            rules: BTreeMap::new(),
            encap_flows: BTreeMap::new(),
            bins: BTreeMap::new(),
            direct,
        }
    }

    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.params.lookup == LookupType::Direct
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.encap_flows.is_empty()
    }

    /// Index in the lookup table of the engine of bin `bin`
    #[must_use]
    pub fn lookup_index(&self, bin: u32) -> u32 {
        self.lookup_base + bin
    }

    /// The bin of a rule: its id for direct groups, the hash of its match key otherwise
    #[must_use]
    pub fn bin_for(
        &self,
        rule: RuleId,
        condition: TunnelCondition,
        params: &ConditionParams,
    ) -> u32 {
        if self.is_direct() {
            rule
        } else {
            u32::from(compute_hash_key(condition, params)) & (self.lookup_size - 1)
        }
    }

    /// Number of counters held by the rules and flows of the group
    #[must_use]
    pub fn counters(&self) -> u32 {
        let rules = self.rules.values().filter(|r| r.counter.is_some()).count();
        let flows = self.encap_flows.values().filter(|f| f.counter.is_some()).count();
        u32::try_from(rules + flows).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn info(&self) -> TunnelGroupInfo {
        TunnelGroupInfo {
            id: self.id,
            params: self.params.clone(),
            lookup_base: self.lookup_base,
            lookup_size: self.lookup_size,
            glort: self.glort,
            rules: self.rules.len(),
            encap_flows: self.encap_flows.len(),
            bins: self.bins.len(),
        }
    }
}
