// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Encap flows: reusable encapsulation actions

use bitflags::bitflags;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};

use crate::model::bin::BlockRef;
use crate::types::{FlowId, Mac, RuleId};

/// Words of a NGE variable header
pub const NGE_WORDS: usize = 16;
/// Words of NSH metadata that fit in the variable header
pub const NSH_DATA_MAX_WORDS: usize = 14;

bitflags! {
    /// Fields of an encap record. Also used as the action of an encap flow.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct EncapField: u32 {
        const VNI             = 1 << 0;
        const DMAC            = 1 << 1;
        const SMAC            = 1 << 2;
        const VLAN            = 1 << 3;
        const DIP             = 1 << 4;
        const SIP             = 1 << 5;
        const TOS             = 1 << 6;
        const TTL             = 1 << 7;
        const L4SRC           = 1 << 8;
        const L4DST           = 1 << 9;
        const COUNTER         = 1 << 10;
        const FLOW_PTR        = 1 << 11;
        const NGE             = 1 << 12;
        const GPE_NEXT_PROT   = 1 << 13;
        const NSH_BASE_HDR    = 1 << 14;
        const NSH_SERVICE_HDR = 1 << 15;
        const NSH_DATA        = 1 << 16;
    }
}

impl EncapField {
    /// Fields belonging to the VXLAN-GPE and NSH extension headers
    pub const GPE_NSH: Self = Self::GPE_NEXT_PROT
        .union(Self::NSH_BASE_HDR)
        .union(Self::NSH_SERVICE_HDR)
        .union(Self::NSH_DATA);
}

/// NGE variable header: the words whose bit is set in `mask`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NgeData {
    pub mask: u16,
    pub words: [u32; NGE_WORDS],
}

impl NgeData {
    /// The words selected by the mask, in ascending position
    pub fn selected(&self) -> impl Iterator<Item = u32> + '_ {
        self.words
            .iter()
            .enumerate()
            .filter(|(i, _)| self.mask & (1u16 << *i) != 0)
            .map(|(_, w)| *w)
    }

    #[must_use]
    pub fn word_count(&self) -> usize {
        self.mask.count_ones() as usize
    }

    /// Overlay the words selected in `other`
    #[must_use]
    pub fn merged(&self, other: &NgeData) -> NgeData {
        let mut merged = self.clone();
        for (i, word) in other.words.iter().enumerate() {
            if other.mask & (1u16 << i) != 0 {
                merged.words[i] = *word;
            }
        }
        merged.mask |= other.mask;
        merged
    }
}

/// NSH headers carried by a VXLAN-GPE encapsulation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NshData {
    pub base_hdr: u32,
    pub service_hdr: u32,
    pub metadata: Vec<u32>,
}

/// Flow pointer: location of the block of a shared flow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowPtr {
    pub index: u32,
    pub length: u32,
}

impl From<BlockRef> for FlowPtr {
    fn from(block: BlockRef) -> Self {
        Self {
            index: block.start,
            length: block.length,
        }
    }
}

/// Values of the fields of an encap record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapValues {
    pub vni: u32,
    pub dmac: Mac,
    pub smac: Mac,
    pub vlan: u16,
    pub dip: IpAddr,
    pub sip: IpAddr,
    pub tos: u8,
    pub ttl: u8,
    pub l4_src: u16,
    pub l4_dst: u16,
    pub counter: u32,
    pub flow_ptr: FlowPtr,
    pub nge: NgeData,
    pub gpe_next_prot: u8,
    pub nsh: NshData,
}

impl Default for EncapValues {
    fn default() -> Self {
        Self {
            vni: 0,
            dmac: Mac::default(),
            smac: Mac::default(),
            vlan: 0,
            dip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tos: 0,
            ttl: 0,
            l4_src: 0,
            l4_dst: 0,
            counter: 0,
            flow_ptr: FlowPtr::default(),
            nge: NgeData::default(),
            gpe_next_prot: 0,
            nsh: NshData::default(),
        }
    }
}

impl EncapValues {
    /// A copy holding only the values of `fields`, the others being reset
    #[must_use]
    pub fn masked(&self, fields: EncapField) -> Self {
        let d = Self::default();
        let keep = |f: EncapField| fields.contains(f);
        Self {
            vni: if keep(EncapField::VNI) { self.vni } else { d.vni },
            dmac: if keep(EncapField::DMAC) { self.dmac } else { d.dmac },
            smac: if keep(EncapField::SMAC) { self.smac } else { d.smac },
            vlan: if keep(EncapField::VLAN) { self.vlan } else { d.vlan },
            dip: if keep(EncapField::DIP) { self.dip } else { d.dip },
            sip: if keep(EncapField::SIP) { self.sip } else { d.sip },
            tos: if keep(EncapField::TOS) { self.tos } else { d.tos },
            ttl: if keep(EncapField::TTL) { self.ttl } else { d.ttl },
            l4_src: if keep(EncapField::L4SRC) { self.l4_src } else { d.l4_src },
            l4_dst: if keep(EncapField::L4DST) { self.l4_dst } else { d.l4_dst },
            counter: if keep(EncapField::COUNTER) { self.counter } else { d.counter },
            flow_ptr: if keep(EncapField::FLOW_PTR) { self.flow_ptr } else { d.flow_ptr },
            nge: if keep(EncapField::NGE) { self.nge.clone() } else { d.nge },
            gpe_next_prot: if keep(EncapField::GPE_NEXT_PROT) {
                self.gpe_next_prot
            } else {
                d.gpe_next_prot
            },
            nsh: NshData {
                base_hdr: if keep(EncapField::NSH_BASE_HDR) { self.nsh.base_hdr } else { 0 },
                service_hdr: if keep(EncapField::NSH_SERVICE_HDR) {
                    self.nsh.service_hdr
                } else {
                    0
                },
                metadata: if keep(EncapField::NSH_DATA) {
                    self.nsh.metadata.clone()
                } else {
                    Vec::new()
                },
            },
        }
    }
}

/// What the caller gives to create or update an encap flow
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncapFlowParams {
    /// A shared flow has its own TE-Data block that rules point to; an unshared one is copied
    /// into the block of every rule that uses it.
    pub shared: bool,
    /// The fields the flow sets. `FLOW_PTR` is not allowed.
    pub action: EncapField,
    pub values: EncapValues,
}

/// An encap flow of a tunnel group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapFlow {
    pub id: FlowId,
    pub params: EncapFlowParams,
    /// Counter index, when the action has `COUNTER`
    pub counter: Option<u32>,
    /// Block of a shared flow
    pub block: Option<BlockRef>,
    /// Previous blocks of a shared flow, until no installed bin points to them anymore
    pub(crate) retired: Vec<BlockRef>,
    /// The rules using this flow
    pub rules: BTreeSet<RuleId>,
}

impl EncapFlow {
    pub(crate) fn new(id: FlowId, params: EncapFlowParams, counter: Option<u32>) -> Self {
        Self {
            id,
            params,
            counter,
            block: None,
            retired: Vec::new(),
            rules: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.params.shared
    }
}
