// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tunnel rules: a match condition and an action

use bitflags::bitflags;
use std::net::{IpAddr, Ipv4Addr};

use crate::model::flow::{EncapField, NgeData, NshData};
use crate::types::{FlowId, Mac, RuleId};

bitflags! {
    /// Match fields of a rule of a hash lookup group
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct TunnelCondition: u32 {
        const VSI_TEP = 1 << 0;
        const VNI     = 1 << 1;
        const DMAC    = 1 << 2;
        const SMAC    = 1 << 3;
        const VLAN    = 1 << 4;
        const DIP     = 1 << 5;
        const SIP     = 1 << 6;
        const L4SRC   = 1 << 7;
        const L4DST   = 1 << 8;
        /// Match the IP protocol field
        const PROT    = 1 << 9;
        /// Match UDP packets
        const UDP     = 1 << 10;
        /// Match TCP packets
        const TCP     = 1 << 11;
    }
}

/// Values of the match fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionParams {
    pub vsi_tep: u16,
    pub vni: u32,
    pub dmac: Mac,
    pub smac: Mac,
    pub vlan: u16,
    pub dip: IpAddr,
    pub sip: IpAddr,
    pub l4_src: u16,
    pub l4_dst: u16,
    pub protocol: u8,
}

impl Default for ConditionParams {
    fn default() -> Self {
        Self {
            vsi_tep: 0,
            vni: 0,
            dmac: Mac::default(),
            smac: Mac::default(),
            vlan: 0,
            dip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            l4_src: 0,
            l4_dst: 0,
            protocol: 0,
        }
    }
}

bitflags! {
    /// Action of a rule. Decap groups use the `SET_*GLORT`, rewrite and `SET_TTL` bits; encap
    /// groups use `ENCAP_FLOW` and the encap overrides.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct RuleAction: u32 {
        const SET_DGLORT          = 1 << 0;
        const SET_SGLORT          = 1 << 1;
        const SET_DMAC            = 1 << 2;
        const SET_SMAC            = 1 << 3;
        const SET_VLAN            = 1 << 4;
        const SET_DIP             = 1 << 5;
        const SET_SIP             = 1 << 6;
        const SET_L4SRC           = 1 << 7;
        const SET_L4DST           = 1 << 8;
        const SET_TTL             = 1 << 9;
        const COUNTER             = 1 << 10;
        const ENCAP_FLOW          = 1 << 11;
        const SET_VNI             = 1 << 12;
        const SET_NGE             = 1 << 13;
        const SET_GPE_NEXT_PROT   = 1 << 14;
        const SET_NSH_BASE_HDR    = 1 << 15;
        const SET_NSH_SERVICE_HDR = 1 << 16;
        const SET_NSH_DATA        = 1 << 17;
    }
}

impl RuleAction {
    /// Actions allowed in a decap group
    pub const DECAP: Self = Self::SET_DGLORT
        .union(Self::SET_SGLORT)
        .union(Self::SET_DMAC)
        .union(Self::SET_SMAC)
        .union(Self::SET_VLAN)
        .union(Self::SET_DIP)
        .union(Self::SET_SIP)
        .union(Self::SET_L4SRC)
        .union(Self::SET_L4DST)
        .union(Self::SET_TTL)
        .union(Self::COUNTER);

    /// Actions allowed in an encap group
    pub const ENCAP: Self = Self::ENCAP_FLOW
        .union(Self::SET_VNI)
        .union(Self::SET_DMAC)
        .union(Self::SET_SMAC)
        .union(Self::SET_VLAN)
        .union(Self::COUNTER)
        .union(Self::SET_NGE)
        .union(Self::SET_GPE_NEXT_PROT)
        .union(Self::SET_NSH_BASE_HDR)
        .union(Self::SET_NSH_SERVICE_HDR)
        .union(Self::SET_NSH_DATA);

    /// The encap record fields overridden by the action of an encap rule
    #[must_use]
    pub fn encap_overrides(self) -> EncapField {
        const MAP: [(RuleAction, EncapField); 10] = [
            (RuleAction::SET_VNI, EncapField::VNI),
            (RuleAction::SET_DMAC, EncapField::DMAC),
            (RuleAction::SET_SMAC, EncapField::SMAC),
            (RuleAction::SET_VLAN, EncapField::VLAN),
            (RuleAction::COUNTER, EncapField::COUNTER),
            (RuleAction::SET_NGE, EncapField::NGE),
            (RuleAction::SET_GPE_NEXT_PROT, EncapField::GPE_NEXT_PROT),
            (RuleAction::SET_NSH_BASE_HDR, EncapField::NSH_BASE_HDR),
            (RuleAction::SET_NSH_SERVICE_HDR, EncapField::NSH_SERVICE_HDR),
            (RuleAction::SET_NSH_DATA, EncapField::NSH_DATA),
        ];
        MAP.iter()
            .filter(|(action, _)| self.contains(*action))
            .fold(EncapField::empty(), |acc, (_, field)| acc | *field)
    }
}

/// Values used by the action of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleActionParams {
    pub dglort: u16,
    pub sglort: u16,
    pub dmac: Mac,
    pub smac: Mac,
    pub vlan: u16,
    pub dip: IpAddr,
    pub sip: IpAddr,
    pub l4_src: u16,
    pub l4_dst: u16,
    pub ttl: u8,
    pub encap_flow: FlowId,
    pub vni: u32,
    pub nge: NgeData,
    pub gpe_next_prot: u8,
    pub nsh: NshData,
}

impl Default for RuleActionParams {
    fn default() -> Self {
        Self {
            dglort: 0,
            sglort: 0,
            dmac: Mac::default(),
            smac: Mac::default(),
            vlan: 0,
            dip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            sip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            l4_src: 0,
            l4_dst: 0,
            ttl: 0,
            encap_flow: 0,
            vni: 0,
            nge: NgeData::default(),
            gpe_next_prot: 0,
            nsh: NshData::default(),
        }
    }
}

/// A rule of a tunnel group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: RuleId,
    pub condition: TunnelCondition,
    pub cond_params: ConditionParams,
    pub action: RuleAction,
    pub action_params: RuleActionParams,
    /// Counter index, when the action has `COUNTER`
    pub counter: Option<u32>,
    /// The lookup bin the rule is in
    pub lookup_bin: u32,
    /// TE-Data slot where the records of the rule start
    pub data_pos: u32,
}

impl Rule {
    /// The encap flow the rule uses
    #[must_use]
    pub fn encap_flow(&self) -> Option<FlowId> {
        self.action
            .contains(RuleAction::ENCAP_FLOW)
            .then_some(self.action_params.encap_flow)
    }
}
