// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Identifiers and small value types shared by the tunnel modules

use std::fmt::Display;

use crate::errors::TunnelError;

pub use hal::EngineId;

/// Identifier of a tunnel group
pub type GroupId = u32;
/// Identifier of a rule, unique within its tunnel group
pub type RuleId = u32;
/// Identifier of an encap flow, unique within its tunnel group
pub type FlowId = u32;

/// Largest VXLAN network identifier
pub const VNI_MAX: u32 = 0x00FF_FFFF;

/// Check that a value fits in the 24 bits of a VNI
pub fn check_vni(vni: u32) -> Result<u32, TunnelError> {
    if vni > VNI_MAX {
        Err(TunnelError::InvalidArgument("VNI larger than 24 bits"))
    } else {
        Ok(vni)
    }
}

/// A MAC address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
    }

    #[must_use]
    pub fn from_u64(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&bytes[2..]);
        Mac(mac)
    }
}

impl From<[u8; 6]> for Mac {
    fn from(value: [u8; 6]) -> Self {
        Mac(value)
    }
}

impl Display for Mac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// How a tunnel group maps packets to its lookup entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LookupType {
    /// Entries are selected by hashing the match key of the packet
    #[default]
    Hash,
    /// Entries are selected by an index carried with the packet
    Direct,
}

/// Encapsulation used by an encap group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TunnelType {
    #[default]
    Vxlan,
    Nge,
    VxlanGpe,
}

impl Display for LookupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupType::Hash => write!(f, "hash"),
            LookupType::Direct => write!(f, "direct"),
        }
    }
}

impl Display for TunnelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelType::Vxlan => write!(f, "vxlan"),
            TunnelType::Nge => write!(f, "nge"),
            TunnelType::VxlanGpe => write!(f, "vxlan-gpe"),
        }
    }
}
