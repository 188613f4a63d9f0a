// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Errors of the tunnel table manager

use crate::types::{FlowId, GroupId, RuleId};
use hal::HalError;
use thiserror::Error;
use tracing::error;

/// Broad category of a [`TunnelError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    ResourceExhaustion,
    Conflict,
    InvalidId,
    Internal,
    Memory,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Not enough free TE-Data slots")]
    FlowFull,
    #[error("No free counter on engine {0}")]
    CountFull(u8),
    #[error("No free TE lookup range of {0} entries")]
    LookupFull(u32),
    #[error("No free GLORT range of {0} entries")]
    GlortFull(u32),
    #[error("All tunnel group slots of engine {0} are in use")]
    GroupFull(u8),
    #[error("No free tunnel group id")]
    NoFreeGroup,
    #[error("Lookup bin {bin} would exceed {max} slots")]
    BinFull { bin: u32, max: u32 },
    #[error("Conflicting tunnel parameters: {0}")]
    TunnelConflict(&'static str),
    #[error("No encap flow {0}")]
    NoEncapFlow(FlowId),
    #[error("Tunnel type mismatch: {0}")]
    TunnelType(&'static str),
    #[error("Invalid TEP size {0}")]
    TepSize(u32),
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Invalid entry: {0}")]
    InvalidEntry(&'static str),
    #[error("No tunnel group {0}")]
    NoSuchGroup(GroupId),
    #[error("No rule {1} in tunnel group {0}")]
    NoSuchRule(GroupId, RuleId),
    #[error("Still in use: {0}")]
    InUse(&'static str),
    #[error("Out of memory: {0}")]
    NoMem(&'static str),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Hardware access failed: {0}")]
    Hal(#[from] HalError),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TunnelError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            TunnelError::FlowFull
            | TunnelError::CountFull(_)
            | TunnelError::LookupFull(_)
            | TunnelError::GlortFull(_)
            | TunnelError::GroupFull(_)
            | TunnelError::NoFreeGroup
            | TunnelError::BinFull { .. } => ErrorClass::ResourceExhaustion,
            TunnelError::TunnelConflict(_)
            | TunnelError::NoEncapFlow(_)
            | TunnelError::TunnelType(_)
            | TunnelError::TepSize(_)
            | TunnelError::InvalidArgument(_)
            | TunnelError::InUse(_)
            | TunnelError::InvalidConfig(_) => ErrorClass::Conflict,
            TunnelError::InvalidEntry(_)
            | TunnelError::NoSuchGroup(_)
            | TunnelError::NoSuchRule(..) => ErrorClass::InvalidId,
            TunnelError::Internal(_) | TunnelError::Hal(_) => ErrorClass::Internal,
            TunnelError::NoMem(_) => ErrorClass::Memory,
        }
    }

    /// Whether this error leaves hardware and bookkeeping exactly as they were before the call
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.class() != ErrorClass::Internal
    }

    /// Log and build an internal consistency error
    pub(crate) fn internal(what: impl Into<String>) -> Self {
        let what = what.into();
        error!("{what}");
        TunnelError::Internal(what)
    }
}
