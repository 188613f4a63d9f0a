// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Lookup bins: the lookup entries of a group and the rules encoded in their block

use std::collections::BTreeSet;
use std::fmt::Display;

use crate::types::{FlowId, RuleId};

/// Location of a block in the TE-Data table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub start: u32,
    pub length: u32,
}

impl BlockRef {
    #[must_use]
    pub fn new(start: u32, length: u32) -> Self {
        Self { start, length }
    }
}

impl Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.start, self.length)
    }
}

/// A lookup entry of a group, relative to the lookup base of the group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupBin {
    pub index: u32,
    /// The rules in the bin
    pub rules: BTreeSet<RuleId>,
    /// The block the lookup entry points at
    pub block: Option<BlockRef>,
    /// Offsets of the records of each rule in the installed block
    pub(crate) rule_offsets: Vec<(RuleId, u32)>,
    /// Offsets of the slots of the installed block that point to a shared flow
    pub(crate) flow_ptrs: Vec<(FlowId, u32)>,
}

impl LookupBin {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    /// Whether the installed block points to shared flow `flow`
    #[must_use]
    pub fn points_to(&self, flow: FlowId) -> bool {
        self.flow_ptrs.iter().any(|(f, _)| *f == flow)
    }
}
