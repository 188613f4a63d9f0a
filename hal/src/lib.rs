// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Hardware access layer of the tunneling engines.
//!
//! The tunnel table manager never touches registers directly: it goes through the [`TeHal`]
//! capability, which batches register words per table entry and can optionally block until the
//! hardware confirms that a write has been applied.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc)]

#[cfg(any(test, feature = "testing"))]
pub mod sim;

use bitflags::bitflags;
use std::fmt::Display;
use thiserror::Error;

/// Identifier of a tunneling engine
pub type EngineId = u8;

/// Number of 32-bit register words per TE-Data slot
pub const TE_DATA_WIDTH: usize = 2;

/// Description of an indexed register table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDesc {
    pub name: &'static str,
    pub words_per_entry: usize,
    pub entries: u32,
}

/// The TE-Data table, holding the encoded tunnel blocks
pub const TE_DATA: RegisterDesc = RegisterDesc {
    name: "TE_DATA",
    words_per_entry: TE_DATA_WIDTH,
    entries: 16384,
};

/// The TE lookup table, whose entries point at TE-Data blocks
pub const TE_LOOKUP: RegisterDesc = RegisterDesc {
    name: "TE_LOOKUP",
    words_per_entry: 1,
    entries: 16384,
};

/// Value of a TE lookup table entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LookupEntry {
    pub data_ptr: u16,
    pub data_length: u16,
    pub last: bool,
}

impl LookupEntry {
    #[must_use]
    pub fn new(data_ptr: u16, data_length: u16) -> Self {
        Self {
            data_ptr,
            data_length,
            last: true,
        }
    }

    /// An entry that points nowhere
    #[must_use]
    pub fn invalid() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.data_length != 0
    }
}

impl Display for LookupEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ptr={} len={} last={}",
            self.data_ptr, self.data_length, self.last
        )
    }
}

bitflags! {
    /// Fields of a [`LookupEntry`] updated by a write
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LookupFields: u8 {
        const DATA_PTR    = 0b001;
        const DATA_LENGTH = 0b010;
        const LAST        = 0b100;
    }
}

/// Whether a write returns as soon as it is posted or only once the hardware applied it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteMode {
    Posted,
    Confirmed,
}

/// Packet and byte counts of a tunnel counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowCounter {
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HalError {
    #[error("No such tunneling engine {0}")]
    NoSuchEngine(EngineId),
    #[error("{register} index {index} (+{len}) out of range")]
    OutOfRange {
        register: &'static str,
        index: u32,
        len: u32,
    },
    #[error("Buffer of {0} words is not a whole number of entries")]
    BadBufferLength(usize),
    #[error("Register access failed: {0}")]
    AccessFailure(String),
}

/// Register-level access to the tunneling engines.
///
/// Writes issued through one [`TeHal`] are applied in the order they were issued.
pub trait TeHal: Send {
    /// Read `buf.len() / words_per_entry` consecutive entries starting at `index`
    fn read_block(
        &mut self,
        reg: &RegisterDesc,
        index: u32,
        engine: EngineId,
        buf: &mut [u32],
    ) -> Result<(), HalError>;

    /// Write `buf.len() / words_per_entry` consecutive entries starting at `index`
    fn write_block(
        &mut self,
        reg: &RegisterDesc,
        index: u32,
        engine: EngineId,
        buf: &[u32],
        mode: WriteMode,
    ) -> Result<(), HalError>;

    fn set_lookup_entry(
        &mut self,
        engine: EngineId,
        index: u32,
        entry: LookupEntry,
        fields: LookupFields,
        mode: WriteMode,
    ) -> Result<(), HalError>;

    fn get_lookup_entry(&mut self, engine: EngineId, index: u32) -> Result<LookupEntry, HalError>;

    fn set_flow_used_bit(&mut self, engine: EngineId, index: u32, used: bool)
    -> Result<(), HalError>;

    fn get_flow_used_bit(&mut self, engine: EngineId, index: u32) -> Result<bool, HalError>;

    fn set_flow_counter(
        &mut self,
        engine: EngineId,
        counter: u32,
        value: FlowCounter,
    ) -> Result<(), HalError>;

    fn get_flow_counter(&mut self, engine: EngineId, counter: u32)
    -> Result<FlowCounter, HalError>;

    /// Barrier: returns once every lookup write issued so far on `engine` is committed
    fn sync_lookup(&mut self, engine: EngineId) -> Result<(), HalError>;
}
