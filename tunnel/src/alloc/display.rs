// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Diagnostic dump of a TE-Data table

use std::fmt::Display;

use super::TeDataTable;

impl Display for TeDataTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "TE-Data engine {}: {} slots, {} free, first free {}, swap {}+{}",
            self.engine,
            self.size,
            self.free_count,
            self.first_free,
            self.swap_base(),
            self.swap_size
        )?;
        let mut start = 1usize;
        while start < self.handler.len() {
            let handle = self.handler[start];
            let mut end = start;
            while end + 1 < self.handler.len() && self.handler[end + 1] == handle {
                end += 1;
            }
            match self.controls.get(&handle) {
                Some(ctrl) if handle != 0 => writeln!(
                    f,
                    "{start}-{end}: {handle} {} {} {} {}",
                    ctrl.length, ctrl.group, ctrl.kind, ctrl.entry
                )?,
                _ => writeln!(f, "{start}-{end}: free")?,
            }
            start = end + 1;
        }
        Ok(())
    }
}
