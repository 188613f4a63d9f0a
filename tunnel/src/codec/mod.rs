// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Binary layout of the content of TE-Data blocks.
//!
//! A block is a chain of records. Each record starts with a header slot:
//!
//! | bits  | content                       |
//! |-------|-------------------------------|
//! | 0-7   | record kind                   |
//! | 8     | last record of the block      |
//! | 9     | DIP is IPv6                   |
//! | 10    | SIP is IPv6                   |
//! | 32-63 | mask of the fields present    |
//!
//! The fields present follow the header in ascending mask bit order. Addresses take one slot
//! for IPv4 and two for IPv6 (high half first), variable headers take a leading slot with their
//! word mask or count and their 32-bit words packed two per slot. Every other field takes one
//! slot. A slot is written to the hardware as two register words, low word first.

pub mod encap;
pub mod hash;
pub mod rule;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tracectl::trace_target;

use crate::errors::TunnelError;
use crate::model::flow::{EncapField, EncapValues, FlowPtr, NGE_WORDS, NgeData};
use crate::model::rule::{ConditionParams, RuleAction, RuleActionParams, TunnelCondition};
use crate::types::Mac;
use hal::TE_DATA_WIDTH;

trace_target!("tunnel-codec", LevelFilter::INFO, &["tunnel"]);

/// One TE-Data slot
pub type Slot = u64;

const KIND_FLOW_KEY: u8 = 1;
const KIND_ENCAP: u8 = 2;
const KIND_DECAP: u8 = 3;

const HDR_LAST: u64 = 1 << 8;
const HDR_DIP_V6: u64 = 1 << 9;
const HDR_SIP_V6: u64 = 1 << 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Block truncated at slot {0}")]
    Truncated(usize),
    #[error("Unknown record kind {kind} at slot {at}")]
    BadKind { kind: u8, at: usize },
    #[error("Unknown fields {mask:#x} in record at slot {at}")]
    BadFields { mask: u32, at: usize },
    #[error("Bad variable header at slot {0}")]
    BadVariableHeader(usize),
    #[error("Record at slot {0} is marked last but the block is longer")]
    TrailingSlots(usize),
    #[error("Block ends at slot {0} without a last record")]
    MissingLast(usize),
}

impl From<CodecError> for TunnelError {
    fn from(value: CodecError) -> Self {
        TunnelError::Internal(value.to_string())
    }
}

/// Match key of a rule of a hash group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowKeyRecord {
    pub condition: TunnelCondition,
    pub params: ConditionParams,
}

/// Encapsulation data: either a complete encapsulation or a pointer to a shared flow plus the
/// fields the rule overrides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapRecord {
    pub fields: EncapField,
    pub values: EncapValues,
}

/// Decapsulation data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecapRecord {
    pub fields: RuleAction,
    pub params: RuleActionParams,
    pub counter: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeRecord {
    FlowKey(FlowKeyRecord),
    Encap(EncapRecord),
    Decap(DecapRecord),
}

fn ip_slots(ip: &IpAddr) -> usize {
    if ip.is_ipv6() { 2 } else { 1 }
}

fn word_slots(words: usize) -> usize {
    words.div_ceil(2)
}

impl EncapRecord {
    /// Slots of the fields preceding `field` in the record, header included
    fn offset_of(&self, field: EncapField) -> usize {
        let v = &self.values;
        let mut slots = 1;
        for f in self.fields.iter() {
            if f == field {
                break;
            }
            slots += match f {
                EncapField::DIP => ip_slots(&v.dip),
                EncapField::SIP => ip_slots(&v.sip),
                EncapField::NGE => 1 + word_slots(v.nge.word_count()),
                EncapField::NSH_DATA => 1 + word_slots(v.nsh.metadata.len()),
                _ => 1,
            };
        }
        slots
    }

    /// Offset of the flow pointer slot in the record
    #[must_use]
    pub fn flow_ptr_offset(&self) -> Option<usize> {
        self.fields
            .contains(EncapField::FLOW_PTR)
            .then(|| self.offset_of(EncapField::FLOW_PTR))
    }

    fn slot_count(&self) -> usize {
        self.offset_of(EncapField::all())
    }
}

impl FlowKeyRecord {
    fn slot_count(&self) -> usize {
        let p = &self.params;
        self.condition
            .iter()
            .map(|c| match c {
                TunnelCondition::DIP => ip_slots(&p.dip),
                TunnelCondition::SIP => ip_slots(&p.sip),
                TunnelCondition::UDP | TunnelCondition::TCP => 0,
                _ => 1,
            })
            .sum::<usize>()
            + 1
    }
}

impl DecapRecord {
    fn slot_count(&self) -> usize {
        let p = &self.params;
        self.fields
            .iter()
            .map(|f| match f {
                RuleAction::SET_DIP => ip_slots(&p.dip),
                RuleAction::SET_SIP => ip_slots(&p.sip),
                _ => 1,
            })
            .sum::<usize>()
            + 1
    }
}

impl TeRecord {
    #[must_use]
    pub fn slot_count(&self) -> usize {
        match self {
            TeRecord::FlowKey(r) => r.slot_count(),
            TeRecord::Encap(r) => r.slot_count(),
            TeRecord::Decap(r) => r.slot_count(),
        }
    }
}

/// Number of slots the records take once serialized
#[must_use]
pub fn size_of(records: &[TeRecord]) -> usize {
    records.iter().map(TeRecord::slot_count).sum()
}

fn header(kind: u8, last: bool, dip: Option<&IpAddr>, sip: Option<&IpAddr>, mask: u32) -> Slot {
    let mut slot = u64::from(kind) | (u64::from(mask) << 32);
    if last {
        slot |= HDR_LAST;
    }
    if dip.is_some_and(IpAddr::is_ipv6) {
        slot |= HDR_DIP_V6;
    }
    if sip.is_some_and(IpAddr::is_ipv6) {
        slot |= HDR_SIP_V6;
    }
    slot
}

struct SlotWriter {
    slots: Vec<Slot>,
}

impl SlotWriter {
    fn push(&mut self, value: impl Into<u64>) {
        self.slots.push(value.into());
    }

    fn ip(&mut self, ip: &IpAddr) {
        match ip {
            IpAddr::V4(v4) => self.push(u32::from(*v4)),
            IpAddr::V6(v6) => {
                let bits = u128::from(*v6);
                #[allow(clippy::cast_possible_truncation)]
                {
                    self.push((bits >> 64) as u64);
                    self.push(bits as u64);
                }
            }
        }
    }

    fn mac(&mut self, mac: &Mac) {
        self.push(mac.as_u64());
    }

    fn words(&mut self, words: impl Iterator<Item = u32>) {
        let words: Vec<u32> = words.collect();
        for pair in words.chunks(2) {
            let low = u64::from(pair[0]);
            let high = pair.get(1).copied().map_or(0, u64::from);
            self.push(low | (high << 32));
        }
    }

    fn flow_key(&mut self, r: &FlowKeyRecord, last: bool) {
        let p = &r.params;
        let c = r.condition;
        self.push(header(
            KIND_FLOW_KEY,
            last,
            c.contains(TunnelCondition::DIP).then_some(&p.dip),
            c.contains(TunnelCondition::SIP).then_some(&p.sip),
            c.bits(),
        ));
        for field in c.iter() {
            match field {
                TunnelCondition::VSI_TEP => self.push(p.vsi_tep),
                TunnelCondition::VNI => self.push(p.vni),
                TunnelCondition::DMAC => self.mac(&p.dmac),
                TunnelCondition::SMAC => self.mac(&p.smac),
                TunnelCondition::VLAN => self.push(p.vlan),
                TunnelCondition::DIP => self.ip(&p.dip),
                TunnelCondition::SIP => self.ip(&p.sip),
                TunnelCondition::L4SRC => self.push(p.l4_src),
                TunnelCondition::L4DST => self.push(p.l4_dst),
                TunnelCondition::PROT => self.push(p.protocol),
                _ => {}
            }
        }
    }

    fn encap(&mut self, r: &EncapRecord, last: bool) {
        let v = &r.values;
        let f = r.fields;
        self.push(header(
            KIND_ENCAP,
            last,
            f.contains(EncapField::DIP).then_some(&v.dip),
            f.contains(EncapField::SIP).then_some(&v.sip),
            f.bits(),
        ));
        for field in f.iter() {
            match field {
                EncapField::VNI => self.push(v.vni),
                EncapField::DMAC => self.mac(&v.dmac),
                EncapField::SMAC => self.mac(&v.smac),
                EncapField::VLAN => self.push(v.vlan),
                EncapField::DIP => self.ip(&v.dip),
                EncapField::SIP => self.ip(&v.sip),
                EncapField::TOS => self.push(v.tos),
                EncapField::TTL => self.push(v.ttl),
                EncapField::L4SRC => self.push(v.l4_src),
                EncapField::L4DST => self.push(v.l4_dst),
                EncapField::COUNTER => self.push(v.counter),
                EncapField::FLOW_PTR => self.push(flow_ptr_slot(v.flow_ptr)),
                EncapField::NGE => {
                    self.push(v.nge.mask);
                    self.words(v.nge.selected());
                }
                EncapField::GPE_NEXT_PROT => self.push(v.gpe_next_prot),
                EncapField::NSH_BASE_HDR => self.push(v.nsh.base_hdr),
                EncapField::NSH_SERVICE_HDR => self.push(v.nsh.service_hdr),
                EncapField::NSH_DATA => {
                    self.push(u64::try_from(v.nsh.metadata.len()).unwrap_or(u64::MAX));
                    self.words(v.nsh.metadata.iter().copied());
                }
                _ => {}
            }
        }
    }

    fn decap(&mut self, r: &DecapRecord, last: bool) {
        let p = &r.params;
        let f = r.fields;
        self.push(header(
            KIND_DECAP,
            last,
            f.contains(RuleAction::SET_DIP).then_some(&p.dip),
            f.contains(RuleAction::SET_SIP).then_some(&p.sip),
            f.bits(),
        ));
        for field in f.iter() {
            match field {
                RuleAction::SET_DGLORT => self.push(p.dglort),
                RuleAction::SET_SGLORT => self.push(p.sglort),
                RuleAction::SET_DMAC => self.mac(&p.dmac),
                RuleAction::SET_SMAC => self.mac(&p.smac),
                RuleAction::SET_VLAN => self.push(p.vlan),
                RuleAction::SET_DIP => self.ip(&p.dip),
                RuleAction::SET_SIP => self.ip(&p.sip),
                RuleAction::SET_L4SRC => self.push(p.l4_src),
                RuleAction::SET_L4DST => self.push(p.l4_dst),
                RuleAction::SET_TTL => self.push(p.ttl),
                RuleAction::COUNTER => self.push(r.counter),
                _ => {}
            }
        }
    }
}

/// The slot holding a flow pointer
#[must_use]
pub fn flow_ptr_slot(ptr: FlowPtr) -> Slot {
    u64::from(ptr.index) | (u64::from(ptr.length) << 32)
}

/// Serialize records into the slots of one block, marking the final record as last
#[must_use]
pub fn serialize(records: &[TeRecord]) -> Vec<Slot> {
    let mut writer = SlotWriter {
        slots: Vec::with_capacity(size_of(records)),
    };
    for (i, record) in records.iter().enumerate() {
        let last = i + 1 == records.len();
        match record {
            TeRecord::FlowKey(r) => writer.flow_key(r, last),
            TeRecord::Encap(r) => writer.encap(r, last),
            TeRecord::Decap(r) => writer.decap(r, last),
        }
    }
    writer.slots
}

/// Register words of slots, low word first
#[must_use]
pub fn to_words(slots: &[Slot]) -> Vec<u32> {
    let mut words = Vec::with_capacity(slots.len() * TE_DATA_WIDTH);
    for slot in slots {
        #[allow(clippy::cast_possible_truncation)]
        {
            words.push(*slot as u32);
            words.push((*slot >> 32) as u32);
        }
    }
    words
}

/// Slots of register words, low word first
#[must_use]
pub fn from_words(words: &[u32]) -> Vec<Slot> {
    words
        .chunks(TE_DATA_WIDTH)
        .map(|pair| {
            let low = u64::from(pair[0]);
            let high = pair.get(1).copied().map_or(0, u64::from);
            low | (high << 32)
        })
        .collect()
}

struct SlotReader<'a> {
    slots: &'a [Slot],
    pos: usize,
}

#[allow(clippy::cast_possible_truncation)]
impl SlotReader<'_> {
    fn next(&mut self) -> Result<Slot, CodecError> {
        let slot = *self.slots.get(self.pos).ok_or(CodecError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(slot)
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(self.next()? as u32)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(self.next()? as u16)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.next()? as u8)
    }

    fn mac(&mut self) -> Result<Mac, CodecError> {
        Ok(Mac::from_u64(self.next()?))
    }

    fn ip(&mut self, v6: bool) -> Result<IpAddr, CodecError> {
        if v6 {
            let high = u128::from(self.next()?);
            let low = u128::from(self.next()?);
            Ok(IpAddr::V6(Ipv6Addr::from((high << 64) | low)))
        } else {
            Ok(IpAddr::V4(Ipv4Addr::from(self.u32()?)))
        }
    }

    fn words(&mut self, count: usize) -> Result<Vec<u32>, CodecError> {
        let mut words = Vec::with_capacity(count);
        for _ in 0..word_slots(count) {
            let slot = self.next()?;
            words.push(slot as u32);
            words.push((slot >> 32) as u32);
        }
        words.truncate(count);
        Ok(words)
    }

    fn flow_key(&mut self, mask: u32, dip_v6: bool, sip_v6: bool) -> Result<TeRecord, CodecError> {
        let at = self.pos - 1;
        let condition =
            TunnelCondition::from_bits(mask).ok_or(CodecError::BadFields { mask, at })?;
        let mut p = ConditionParams::default();
        for field in condition.iter() {
            match field {
                TunnelCondition::VSI_TEP => p.vsi_tep = self.u16()?,
                TunnelCondition::VNI => p.vni = self.u32()?,
                TunnelCondition::DMAC => p.dmac = self.mac()?,
                TunnelCondition::SMAC => p.smac = self.mac()?,
                TunnelCondition::VLAN => p.vlan = self.u16()?,
                TunnelCondition::DIP => p.dip = self.ip(dip_v6)?,
                TunnelCondition::SIP => p.sip = self.ip(sip_v6)?,
                TunnelCondition::L4SRC => p.l4_src = self.u16()?,
                TunnelCondition::L4DST => p.l4_dst = self.u16()?,
                TunnelCondition::PROT => p.protocol = self.u8()?,
                _ => {}
            }
        }
        Ok(TeRecord::FlowKey(FlowKeyRecord {
            condition,
            params: p,
        }))
    }

    fn encap(&mut self, mask: u32, dip_v6: bool, sip_v6: bool) -> Result<TeRecord, CodecError> {
        let at = self.pos - 1;
        let fields = EncapField::from_bits(mask).ok_or(CodecError::BadFields { mask, at })?;
        let mut v = EncapValues::default();
        for field in fields.iter() {
            match field {
                EncapField::VNI => v.vni = self.u32()?,
                EncapField::DMAC => v.dmac = self.mac()?,
                EncapField::SMAC => v.smac = self.mac()?,
                EncapField::VLAN => v.vlan = self.u16()?,
                EncapField::DIP => v.dip = self.ip(dip_v6)?,
                EncapField::SIP => v.sip = self.ip(sip_v6)?,
                EncapField::TOS => v.tos = self.u8()?,
                EncapField::TTL => v.ttl = self.u8()?,
                EncapField::L4SRC => v.l4_src = self.u16()?,
                EncapField::L4DST => v.l4_dst = self.u16()?,
                EncapField::COUNTER => v.counter = self.u32()?,
                EncapField::FLOW_PTR => {
                    let slot = self.next()?;
                    v.flow_ptr = FlowPtr {
                        index: slot as u32,
                        length: (slot >> 32) as u32,
                    };
                }
                EncapField::NGE => {
                    let mask = self.u16()?;
                    let at = self.pos;
                    let selected = self.words(mask.count_ones() as usize)?;
                    let mut nge = NgeData {
                        mask,
                        ..Default::default()
                    };
                    let positions = (0..NGE_WORDS).filter(|i| mask & (1u16 << i) != 0);
                    for (i, word) in positions.zip(selected) {
                        *nge.words.get_mut(i).ok_or(CodecError::BadVariableHeader(at))? = word;
                    }
                    v.nge = nge;
                }
                EncapField::GPE_NEXT_PROT => v.gpe_next_prot = self.u8()?,
                EncapField::NSH_BASE_HDR => v.nsh.base_hdr = self.u32()?,
                EncapField::NSH_SERVICE_HDR => v.nsh.service_hdr = self.u32()?,
                EncapField::NSH_DATA => {
                    let at = self.pos;
                    let count = usize::try_from(self.next()?)
                        .ok()
                        .filter(|c| *c <= self.slots.len() * 2)
                        .ok_or(CodecError::BadVariableHeader(at))?;
                    v.nsh.metadata = self.words(count)?;
                }
                _ => {}
            }
        }
        Ok(TeRecord::Encap(EncapRecord { fields, values: v }))
    }

    fn decap(&mut self, mask: u32, dip_v6: bool, sip_v6: bool) -> Result<TeRecord, CodecError> {
        let at = self.pos - 1;
        let fields = RuleAction::from_bits(mask)
            .filter(|f| RuleAction::DECAP.contains(*f))
            .ok_or(CodecError::BadFields { mask, at })?;
        let mut p = RuleActionParams::default();
        let mut counter = 0;
        for field in fields.iter() {
            match field {
                RuleAction::SET_DGLORT => p.dglort = self.u16()?,
                RuleAction::SET_SGLORT => p.sglort = self.u16()?,
                RuleAction::SET_DMAC => p.dmac = self.mac()?,
                RuleAction::SET_SMAC => p.smac = self.mac()?,
                RuleAction::SET_VLAN => p.vlan = self.u16()?,
                RuleAction::SET_DIP => p.dip = self.ip(dip_v6)?,
                RuleAction::SET_SIP => p.sip = self.ip(sip_v6)?,
                RuleAction::SET_L4SRC => p.l4_src = self.u16()?,
                RuleAction::SET_L4DST => p.l4_dst = self.u16()?,
                RuleAction::SET_TTL => p.ttl = self.u8()?,
                RuleAction::COUNTER => counter = self.u32()?,
                _ => {}
            }
        }
        Ok(TeRecord::Decap(DecapRecord {
            fields,
            params: p,
            counter,
        }))
    }
}

/// Parse the records of a block. The final record, and only it, must be marked last.
pub fn decode_block(slots: &[Slot]) -> Result<Vec<TeRecord>, CodecError> {
    let mut reader = SlotReader { slots, pos: 0 };
    let mut records = Vec::new();
    loop {
        let at = reader.pos;
        let header = reader.next()?;
        #[allow(clippy::cast_possible_truncation)]
        let (kind, mask) = (header as u8, (header >> 32) as u32);
        let dip_v6 = header & HDR_DIP_V6 != 0;
        let sip_v6 = header & HDR_SIP_V6 != 0;
        let record = match kind {
            KIND_FLOW_KEY => reader.flow_key(mask, dip_v6, sip_v6)?,
            KIND_ENCAP => reader.encap(mask, dip_v6, sip_v6)?,
            KIND_DECAP => reader.decap(mask, dip_v6, sip_v6)?,
            kind => return Err(CodecError::BadKind { kind, at }),
        };
        records.push(record);
        if header & HDR_LAST != 0 {
            if reader.pos != slots.len() {
                return Err(CodecError::TrailingSlots(at));
            }
            return Ok(records);
        }
        if reader.pos >= slots.len() {
            return Err(CodecError::MissingLast(reader.pos));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod test;
