// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configuration of the tunnel table manager

use derive_builder::Builder;
use serde::Deserialize;
use std::fmt::Display;

use crate::errors::TunnelError;

pub const DEFAULT_ENGINES: u8 = 2;
pub const DEFAULT_TE_DATA_SIZE: u32 = 16384;
pub const DEFAULT_LOOKUP_SIZE: u32 = 16384;
pub const DEFAULT_COUNTERS: u32 = 4096;
pub const DEFAULT_GLORT_BASE: u16 = 0x2000;
pub const DEFAULT_GLORT_SIZE: u32 = 1024;
pub const DEFAULT_MAX_GROUPS: u32 = 32;
pub const DEFAULT_GROUPS_PER_ENGINE: u8 = 8;
pub const DEFAULT_MIN_SWAP_SIZE: u32 = 8;
pub const DEFAULT_FREE_HEADROOM: u32 = 2;
pub const DEFAULT_MAX_BLOCK_LENGTH: u32 = 255;

/// Sizes of the tunneling engines and limits of the manager. N.B we derive a builder type
/// `TunnelConfigBuilder` and provide defaults for each field.
#[derive(Builder, Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// Number of tunneling engines
    #[builder(default = DEFAULT_ENGINES)]
    pub engines: u8,

    /// Number of slots of the TE-Data table of each engine, slot 0 included
    #[builder(default = DEFAULT_TE_DATA_SIZE)]
    pub te_data_size: u32,

    /// Number of entries of the TE lookup table of each engine
    #[builder(default = DEFAULT_LOOKUP_SIZE)]
    pub lookup_size: u32,

    /// Number of counters of each engine
    #[builder(default = DEFAULT_COUNTERS)]
    pub counters: u32,

    #[builder(default = DEFAULT_GLORT_BASE)]
    pub glort_base: u16,

    #[builder(default = DEFAULT_GLORT_SIZE)]
    pub glort_size: u32,

    /// Number of tunnel group ids
    #[builder(default = DEFAULT_MAX_GROUPS)]
    pub max_groups: u32,

    #[builder(default = DEFAULT_GROUPS_PER_ENGINE)]
    pub groups_per_engine: u8,

    /// Size the swap region never shrinks below
    #[builder(default = DEFAULT_MIN_SWAP_SIZE)]
    pub min_swap_size: u32,

    /// Free slots that must remain after any allocation
    #[builder(default = DEFAULT_FREE_HEADROOM)]
    pub free_headroom: u32,

    /// Longest block a lookup entry may point at
    #[builder(default = DEFAULT_MAX_BLOCK_LENGTH)]
    pub max_block_length: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            engines: DEFAULT_ENGINES,
            te_data_size: DEFAULT_TE_DATA_SIZE,
            lookup_size: DEFAULT_LOOKUP_SIZE,
            counters: DEFAULT_COUNTERS,
            glort_base: DEFAULT_GLORT_BASE,
            glort_size: DEFAULT_GLORT_SIZE,
            max_groups: DEFAULT_MAX_GROUPS,
            groups_per_engine: DEFAULT_GROUPS_PER_ENGINE,
            min_swap_size: DEFAULT_MIN_SWAP_SIZE,
            free_headroom: DEFAULT_FREE_HEADROOM,
            max_block_length: DEFAULT_MAX_BLOCK_LENGTH,
        }
    }
}

impl TunnelConfig {
    pub fn from_yaml(input: &str) -> Result<Self, TunnelError> {
        let config: TunnelConfig = serde_yaml_ng::from_str(input)
            .map_err(|e| TunnelError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn invalid(what: &str) -> TunnelError {
        TunnelError::InvalidConfig(what.to_string())
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.engines == 0 {
            return Err(Self::invalid("at least one engine is required"));
        }
        // lookup entries address TE-Data with 16 bits
        if self.te_data_size > 1 << 16 {
            return Err(Self::invalid("TE-Data table larger than 65536 slots"));
        }
        if self.min_swap_size == 0 {
            return Err(Self::invalid("swap region must hold at least one slot"));
        }
        if self.te_data_size < self.min_swap_size + self.free_headroom + 2 {
            return Err(Self::invalid("TE-Data table too small for its swap region"));
        }
        if self.max_block_length == 0 || self.max_block_length > u32::from(u16::MAX) {
            return Err(Self::invalid("maximum block length out of range"));
        }
        if self.lookup_size == 0 {
            return Err(Self::invalid("empty TE lookup table"));
        }
        if self.glort_size == 0 || u32::from(self.glort_base) + self.glort_size > 1 << 16 {
            return Err(Self::invalid("GLORT space out of range"));
        }
        if self.max_groups == 0 || self.groups_per_engine == 0 {
            return Err(Self::invalid("no tunnel groups allowed"));
        }
        Ok(())
    }
}

impl Display for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Tunnel config")?;
        writeln!(f, "  engines        : {}", self.engines)?;
        writeln!(f, "  TE-Data slots  : {}", self.te_data_size)?;
        writeln!(f, "  lookup entries : {}", self.lookup_size)?;
        writeln!(f, "  counters       : {}", self.counters)?;
        writeln!(
            f,
            "  GLORTs         : {:#06x} +{}",
            self.glort_base, self.glort_size
        )?;
        writeln!(
            f,
            "  groups         : {} ({} per engine)",
            self.max_groups, self.groups_per_engine
        )?;
        writeln!(
            f,
            "  swap (min)     : {} headroom: {}",
            self.min_swap_size, self.free_headroom
        )?;
        write!(f, "  max block      : {}", self.max_block_length)
    }
}
