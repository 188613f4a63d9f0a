// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tunnel groups and the objects they own: lookup bins, rules and encap flows.
//!
//! A group owns its objects by value in ordered maps keyed by id. Reverse edges (the rules
//! of a bin, the dependents of a flow) are sets of ids.

pub mod bin;
pub mod flow;
pub mod group;
pub mod rule;
