// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! An in-memory model of the tunneling engines, for tests.
//!
//! [`SimHal`] keeps the TE-Data words, the lookup table, the used bits and the counters of every
//! engine. It records every operation in a journal and can call an observer after each mutating
//! operation, so that tests can check invariants at every intermediate hardware state.

use crate::{
    EngineId, FlowCounter, HalError, LookupEntry, LookupFields, RegisterDesc, TE_DATA, TeHal,
    WriteMode,
};
use std::fmt::Debug;
use tracectl::trace_target;
#[allow(unused)]
use tracing::{debug, warn};

trace_target!("tunnel-hal-sim", LevelFilter::INFO, &["tunnel"]);

/// The simulated state of one tunneling engine
#[derive(Debug, Clone)]
pub struct SimEngine {
    pub te_data: Vec<u32>,
    pub lookup: Vec<LookupEntry>,
    pub used: Vec<bool>,
    pub counters: Vec<FlowCounter>,
}

impl SimEngine {
    fn new(te_data_size: u32, lookup_size: u32, counters: u32) -> Self {
        Self {
            te_data: vec![0; te_data_size as usize * TE_DATA.words_per_entry],
            lookup: vec![LookupEntry::invalid(); lookup_size as usize],
            used: vec![false; te_data_size as usize],
            counters: vec![FlowCounter::default(); counters as usize],
        }
    }

    /// The TE-Data words of `len` slots starting at `index`
    #[must_use]
    pub fn slots(&self, index: u32, len: u32) -> &[u32] {
        let width = TE_DATA.words_per_entry;
        let start = (index as usize * width).min(self.te_data.len());
        let end = ((index + len) as usize * width).min(self.te_data.len());
        &self.te_data[start..end]
    }
}

/// A hardware operation, as recorded in the journal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HalOp {
    ReadBlock {
        engine: EngineId,
        index: u32,
        len: u32,
    },
    WriteBlock {
        engine: EngineId,
        index: u32,
        len: u32,
        mode: WriteMode,
    },
    SetLookup {
        engine: EngineId,
        index: u32,
        entry: LookupEntry,
        mode: WriteMode,
    },
    SetUsedBit {
        engine: EngineId,
        index: u32,
        used: bool,
    },
    SetCounter {
        engine: EngineId,
        counter: u32,
    },
    SyncLookup {
        engine: EngineId,
    },
}

type Observer = Box<dyn FnMut(&SimHal) + Send>;

pub struct SimHal {
    engines: Vec<SimEngine>,
    journal: Vec<HalOp>,
    observer: Option<Observer>,
    writes_before_failure: Option<usize>,
}

impl Debug for SimHal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHal")
            .field("engines", &self.engines.len())
            .field("journal", &self.journal.len())
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl SimHal {
    #[must_use]
    pub fn new(engines: u8, te_data_size: u32, lookup_size: u32, counters: u32) -> Self {
        Self {
            engines: (0..engines)
                .map(|_| SimEngine::new(te_data_size, lookup_size, counters))
                .collect(),
            journal: Vec::new(),
            observer: None,
            writes_before_failure: None,
        }
    }

    /// Install a closure called after every mutating operation
    pub fn set_observer(&mut self, observer: impl FnMut(&SimHal) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    /// Let `count` more writes succeed, then fail every write
    pub fn fail_writes_after(&mut self, count: usize) {
        self.writes_before_failure = Some(count);
    }

    pub fn clear_failures(&mut self) {
        self.writes_before_failure = None;
    }

    #[must_use]
    pub fn engine(&self, engine: EngineId) -> Option<&SimEngine> {
        self.engines.get(usize::from(engine))
    }

    #[must_use]
    pub fn journal(&self) -> &[HalOp] {
        &self.journal
    }

    pub fn clear_journal(&mut self) {
        self.journal.clear();
    }

    /// Increment a counter, as traffic would
    pub fn count_traffic(&mut self, engine: EngineId, counter: u32, bytes: u64) {
        if let Some(c) = self
            .engines
            .get_mut(usize::from(engine))
            .and_then(|e| e.counters.get_mut(counter as usize))
        {
            c.packets += 1;
            c.bytes += bytes;
        }
    }

    /// Mark a TE-Data slot as matched, as traffic would
    pub fn hit(&mut self, engine: EngineId, index: u32) {
        if let Some(used) = self
            .engines
            .get_mut(usize::from(engine))
            .and_then(|e| e.used.get_mut(index as usize))
        {
            *used = true;
        }
    }

    fn engine_mut(&mut self, engine: EngineId) -> Result<&mut SimEngine, HalError> {
        self.engines
            .get_mut(usize::from(engine))
            .ok_or(HalError::NoSuchEngine(engine))
    }

    fn check_write(&mut self) -> Result<(), HalError> {
        match self.writes_before_failure {
            Some(0) => {
                warn!("Injected write failure");
                Err(HalError::AccessFailure("injected write failure".to_string()))
            }
            Some(n) => {
                self.writes_before_failure = Some(n - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn record(&mut self, op: HalOp) {
        debug!("{op:?}");
        let mutating = !matches!(op, HalOp::ReadBlock { .. });
        self.journal.push(op);
        if mutating && let Some(mut observer) = self.observer.take() {
            observer(self);
            self.observer = Some(observer);
        }
    }

    fn range(
        reg: &RegisterDesc,
        index: u32,
        words: usize,
        available: usize,
    ) -> Result<std::ops::Range<usize>, HalError> {
        if words % reg.words_per_entry != 0 {
            return Err(HalError::BadBufferLength(words));
        }
        let start = index as usize * reg.words_per_entry;
        let end = start + words;
        if end > available {
            return Err(HalError::OutOfRange {
                register: reg.name,
                index,
                len: u32::try_from(words / reg.words_per_entry).unwrap_or(u32::MAX),
            });
        }
        Ok(start..end)
    }
}

fn entries(reg: &RegisterDesc, words: usize) -> u32 {
    u32::try_from(words / reg.words_per_entry).unwrap_or(u32::MAX)
}

fn out_of_range(register: &'static str, index: u32) -> HalError {
    HalError::OutOfRange {
        register,
        index,
        len: 1,
    }
}

impl TeHal for SimHal {
    fn read_block(
        &mut self,
        reg: &RegisterDesc,
        index: u32,
        engine: EngineId,
        buf: &mut [u32],
    ) -> Result<(), HalError> {
        let state = self.engine_mut(engine)?;
        let range = Self::range(reg, index, buf.len(), state.te_data.len())?;
        buf.copy_from_slice(&state.te_data[range]);
        self.record(HalOp::ReadBlock {
            engine,
            index,
            len: entries(reg, buf.len()),
        });
        Ok(())
    }

    fn write_block(
        &mut self,
        reg: &RegisterDesc,
        index: u32,
        engine: EngineId,
        buf: &[u32],
        mode: WriteMode,
    ) -> Result<(), HalError> {
        self.check_write()?;
        let state = self.engine_mut(engine)?;
        let range = Self::range(reg, index, buf.len(), state.te_data.len())?;
        state.te_data[range].copy_from_slice(buf);
        self.record(HalOp::WriteBlock {
            engine,
            index,
            len: entries(reg, buf.len()),
            mode,
        });
        Ok(())
    }

    fn set_lookup_entry(
        &mut self,
        engine: EngineId,
        index: u32,
        entry: LookupEntry,
        fields: LookupFields,
        mode: WriteMode,
    ) -> Result<(), HalError> {
        self.check_write()?;
        let state = self.engine_mut(engine)?;
        let current = state
            .lookup
            .get_mut(index as usize)
            .ok_or(out_of_range("TE_LOOKUP", index))?;
        if fields.contains(LookupFields::DATA_PTR) {
            current.data_ptr = entry.data_ptr;
        }
        if fields.contains(LookupFields::DATA_LENGTH) {
            current.data_length = entry.data_length;
        }
        if fields.contains(LookupFields::LAST) {
            current.last = entry.last;
        }
        let entry = *current;
        self.record(HalOp::SetLookup {
            engine,
            index,
            entry,
            mode,
        });
        Ok(())
    }

    fn get_lookup_entry(&mut self, engine: EngineId, index: u32) -> Result<LookupEntry, HalError> {
        self.engine_mut(engine)?
            .lookup
            .get(index as usize)
            .copied()
            .ok_or(out_of_range("TE_LOOKUP", index))
    }

    fn set_flow_used_bit(
        &mut self,
        engine: EngineId,
        index: u32,
        used: bool,
    ) -> Result<(), HalError> {
        self.check_write()?;
        let bit = self
            .engine_mut(engine)?
            .used
            .get_mut(index as usize)
            .ok_or(out_of_range("TE_USED", index))?;
        *bit = used;
        self.record(HalOp::SetUsedBit {
            engine,
            index,
            used,
        });
        Ok(())
    }

    fn get_flow_used_bit(&mut self, engine: EngineId, index: u32) -> Result<bool, HalError> {
        self.engine_mut(engine)?
            .used
            .get(index as usize)
            .copied()
            .ok_or(out_of_range("TE_USED", index))
    }

    fn set_flow_counter(
        &mut self,
        engine: EngineId,
        counter: u32,
        value: FlowCounter,
    ) -> Result<(), HalError> {
        self.check_write()?;
        let slot = self
            .engine_mut(engine)?
            .counters
            .get_mut(counter as usize)
            .ok_or(out_of_range("TE_STATS", counter))?;
        *slot = value;
        self.record(HalOp::SetCounter { engine, counter });
        Ok(())
    }

    fn get_flow_counter(
        &mut self,
        engine: EngineId,
        counter: u32,
    ) -> Result<FlowCounter, HalError> {
        self.engine_mut(engine)?
            .counters
            .get(counter as usize)
            .copied()
            .ok_or(out_of_range("TE_STATS", counter))
    }

    fn sync_lookup(&mut self, engine: EngineId) -> Result<(), HalError> {
        self.engine_mut(engine)?;
        self.record(HalOp::SyncLookup { engine });
        Ok(())
    }
}
