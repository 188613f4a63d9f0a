// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tunnel table manager of the tunneling engines.
//!
//! Tunnel groups own a range of the TE lookup table of an engine. Each lookup entry points at a
//! contiguous block of the per-engine TE-Data table, which holds the encoded match keys and
//! actions of the rules of that lookup bin. Blocks are placed by a slot allocator that keeps a
//! swap region at the top of the table, so that blocks can be moved and the table defragmented
//! while traffic is flowing: every lookup entry points at a complete and valid block at all
//! times.

#![deny(
    unsafe_code,
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic
)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod alloc;
pub mod codec;
pub mod config;
mod engine;
pub mod errors;
pub mod manager;
pub mod model;
pub(crate) mod pool;
pub mod types;

pub use config::{TunnelConfig, TunnelConfigBuilder};
pub use errors::{ErrorClass, TunnelError};
pub use manager::{TeDataUsage, TunnelManager, TunnelUsage, UsageCount};
pub use model::flow::{EncapField, EncapFlow, EncapFlowParams, EncapValues, NgeData, NshData};
pub use model::group::{TunnelGroupInfo, TunnelGroupParams, TunnelGroupParamsBuilder};
pub use model::rule::{ConditionParams, Rule, RuleAction, RuleActionParams, TunnelCondition};
pub use types::{FlowId, GroupId, LookupType, Mac, RuleId, TunnelType};
