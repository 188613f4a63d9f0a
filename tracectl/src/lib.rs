// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Registry of the tracing targets declared by the tunnel crates, and runtime control of
//! their log levels.

pub mod control;
pub mod targets;

// re-exports
pub use control::{TracingControl, get_trace_ctl};
pub use tracing_subscriber::filter::LevelFilter;
