// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of the log level of the registered targets.

use ordermap::OrderMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};
#[allow(unused)]
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, filter::LevelFilter, prelude::*, reload};

use crate::targets::TRACING_TARGETS;
use crate::trace_target;

trace_target!("tracectl", LevelFilter::INFO, &[]);

#[derive(Debug, Clone, PartialEq)]
pub struct TargetCfg {
    pub target: &'static str,
    pub name: &'static str,
    pub level: LevelFilter,
    pub tags: Vec<&'static str>,
}

#[derive(Debug)]
pub(crate) struct TargetCfgDb {
    pub(crate) level: LevelFilter,
    pub(crate) targets: OrderMap<&'static str, TargetCfg>,
}

impl TargetCfgDb {
    fn new(level: LevelFilter) -> Self {
        let mut db = Self {
            level,
            targets: OrderMap::new(),
        };
        for starget in TRACING_TARGETS {
            let mut tags = starget.tags.to_vec();
            if !tags.contains(&starget.name) {
                tags.push(starget.name);
            }
            let cfg = TargetCfg {
                target: starget.target,
                name: starget.name,
                level: starget.level,
                tags,
            };
            if let Some(prior) = db.targets.insert(starget.target, cfg) {
                warn!("Target {} declared more than once", prior.target);
            }
        }
        db
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new(self.level.to_string());
        for target in self.targets.values() {
            match format!("{}={}", target.target, target.level).parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => warn!("Bad directive for target {}: {e}", target.target),
            }
        }
        filter
    }

    fn tagged_mut(&mut self, tag: &str) -> impl Iterator<Item = &mut TargetCfg> {
        self.targets
            .values_mut()
            .filter(move |target| target.tags.iter().any(|t| *t == tag))
    }
}

impl Display for TargetCfgDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:>40} │ {:>8} │ TAGS", "TARGET", "LEVEL")?;
        for target in self.targets.values() {
            writeln!(
                f,
                "{:>40} │ {:>8} │ {}",
                target.target,
                target.level,
                target.tags.join(",")
            )?;
        }
        write!(f, "{:>40} │ {:>8} │ --", "(default)", self.level)
    }
}

/// Handle to the tracing subscriber of the process
#[derive(Debug)]
pub struct TracingControl {
    db: Mutex<TargetCfgDb>,
    reload_filter: reload::Handle<EnvFilter, Registry>,
}

impl TracingControl {
    fn new() -> Self {
        let db = TargetCfgDb::new(LevelFilter::INFO);
        let (filter, reload_filter) = reload::Layer::new(db.env_filter());

        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_target(true)
            .with_thread_names(true)
            .with_level(true);

        // a subscriber may already be installed, e.g. by a test harness
        if let Err(e) = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
        {
            warn!("Tracing subscriber already installed: {e}");
        }

        Self {
            db: Mutex::new(db),
            reload_filter,
        }
    }

    fn reload(&self, db: &TargetCfgDb) {
        if let Err(e) = self.reload_filter.reload(db.env_filter()) {
            error!("Failed to reload tracing filter: {e}");
        }
    }

    fn with_db<R>(&self, f: impl FnOnce(&mut TargetCfgDb) -> R) -> R {
        let mut db = match self.db.lock() {
            Ok(db) => db,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut db)
    }
}

static TRACING_CTL: OnceLock<TracingControl> = OnceLock::new();

/// Get the process-wide [`TracingControl`], installing the subscriber on first use
pub fn get_trace_ctl() -> &'static TracingControl {
    TRACING_CTL.get_or_init(TracingControl::new)
}

impl TracingControl {
    pub fn init() {
        get_trace_ctl();
    }

    /// Set the level of every target carrying `tag`. Returns the number of targets changed.
    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) -> usize {
        self.with_db(|db| {
            let mut changed = 0;
            for target in db.tagged_mut(tag) {
                if target.level != level {
                    target.level = level;
                    changed += 1;
                }
            }
            if changed > 0 {
                self.reload(db);
            }
            info!("Log level for tag '{tag}' set to {level} ({changed} targets changed)");
            changed
        })
    }

    pub fn set_default_level(&self, level: LevelFilter) {
        self.with_db(|db| {
            if db.level != level {
                db.level = level;
                self.reload(db);
            }
        });
    }

    pub fn get_default_level(&self) -> LevelFilter {
        self.with_db(|db| db.level)
    }

    pub fn get_target(&self, target: &str) -> Option<TargetCfg> {
        self.with_db(|db| db.targets.get(target).cloned())
    }

    pub fn get_targets_by_tag(&self, tag: &str) -> Vec<TargetCfg> {
        self.with_db(|db| db.tagged_mut(tag).map(|t| t.clone()).collect())
    }

    /// Parse comma-separated `tag=level` items. `default` sets the default level.
    fn parse_config(input: &str) -> Result<OrderMap<String, LevelFilter>, String> {
        let mut result = OrderMap::new();
        for item in input.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let Some((tag, level)) = item.split_once('=') else {
                return Err(format!("Invalid item '{item}': expected tag=level"));
            };
            let level = LevelFilter::from_str(level.trim())
                .map_err(|e| format!("invalid level '{}': {e}", level.trim()))?;
            result.insert(tag.trim().to_string(), level);
        }
        Ok(result)
    }

    pub fn setup_from_string(&self, input: &str) -> Result<(), String> {
        let config = Self::parse_config(input)?;
        for (tag, level) in &config {
            if tag == "default" {
                self.set_default_level(*level);
            } else {
                self.set_tag_level(tag, *level);
            }
        }
        Ok(())
    }

    pub fn dump(&self) {
        self.with_db(|db| info!("\n{db}"));
    }
}
