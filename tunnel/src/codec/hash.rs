// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Hash of the match key of a rule

use std::net::IpAddr;

use crate::model::rule::{ConditionParams, TunnelCondition};

/// Length of a packed match key
pub const HASH_KEY_LEN: usize = 57;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

fn ip_bytes(ip: &IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Pack the match key at fixed positions, big endian, leaving absent fields zeroed:
///
/// `vsi_tep:2 vni:4 dmac:6 smac:6 vlan:2 dip:16 sip:16 l4src:2 l4dst:2 protocol:1`
#[must_use]
pub fn pack_hash_key(condition: TunnelCondition, params: &ConditionParams) -> [u8; HASH_KEY_LEN] {
    let mut key = [0u8; HASH_KEY_LEN];
    let mut put = |at: usize, bytes: &[u8]| key[at..at + bytes.len()].copy_from_slice(bytes);
    let has = |c: TunnelCondition| condition.contains(c);
    if has(TunnelCondition::VSI_TEP) {
        put(0, &params.vsi_tep.to_be_bytes());
    }
    if has(TunnelCondition::VNI) {
        put(2, &params.vni.to_be_bytes());
    }
    if has(TunnelCondition::DMAC) {
        put(6, &params.dmac.0);
    }
    if has(TunnelCondition::SMAC) {
        put(12, &params.smac.0);
    }
    if has(TunnelCondition::VLAN) {
        put(18, &params.vlan.to_be_bytes());
    }
    if has(TunnelCondition::DIP) {
        put(20, &ip_bytes(&params.dip));
    }
    if has(TunnelCondition::SIP) {
        put(36, &ip_bytes(&params.sip));
    }
    if has(TunnelCondition::L4SRC) {
        put(52, &params.l4_src.to_be_bytes());
    }
    if has(TunnelCondition::L4DST) {
        put(54, &params.l4_dst.to_be_bytes());
    }
    if has(TunnelCondition::UDP) {
        put(56, &[IPPROTO_UDP]);
    } else if has(TunnelCondition::TCP) {
        put(56, &[IPPROTO_TCP]);
    } else if has(TunnelCondition::PROT) {
        put(56, &[params.protocol]);
    }
    key
}

/// Low 16 bits of the CRC32 of the packed match key
#[must_use]
pub fn compute_hash_key(condition: TunnelCondition, params: &ConditionParams) -> u16 {
    let key = pack_hash_key(condition, params);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&key);
    #[allow(clippy::cast_possible_truncation)]
    let hash = hasher.finalize() as u16;
    hash
}
