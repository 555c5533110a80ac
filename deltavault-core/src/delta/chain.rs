/*!
Delta chains: a base state plus an ordered list of delta records.

`state_at(n)` is the base folded through the first `n` deltas. The chain keeps
the fully replayed current state and a sparse set of checkpoint states so that
neither `get_current_state` nor `add_state` has to replay from the base.

A chain is a plain owned value. Share it across threads through
[`ThreadSafeContextWrapper`](crate::sync::ThreadSafeContextWrapper), which
makes every mutation atomic with respect to readers.
*/

use super::compressor::DeltaCompressor;
use super::record::DeltaRecord;
use crate::config::DeltaConfig;
use crate::integrity::{timestamp, State};
use crate::{PersistError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Chain lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainState {
    /// No deltas recorded yet
    Empty,
    /// Deltas accumulating
    Active,
    /// Oldest deltas merged to bound the length
    Optimized,
    /// Collapsed into a new base
    Rebased,
}

/// Shape and cost of a chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainMetrics {
    pub chain_length: usize,
    pub max_chain_length: usize,
    /// Key operations a full replay from the base performs
    pub replay_cost: usize,
    pub total_delta_bytes: u64,
    pub checkpoints: usize,
    pub optimizations: u64,
    pub rebaselines: u64,
    pub last_rebaseline: Option<f64>,
    pub state: ChainState,
}

/// Ordered delta records anchored to a base state
#[derive(Debug, Clone)]
pub struct DeltaChain {
    base_state: State,
    deltas: Vec<DeltaRecord>,
    max_chain_length: usize,
    enable_rebase: bool,
    keep_recent: usize,
    checkpoint_interval: usize,
    checkpoints: BTreeMap<usize, State>,
    current_state: State,
    compressor: Arc<DeltaCompressor>,
    lifecycle: ChainState,
    optimizations: u64,
    rebaselines: u64,
    last_rebaseline: Option<f64>,
}

impl DeltaChain {
    /// New chain with its own compressor using the configured strategy
    pub fn new(base_state: State, config: &DeltaConfig) -> Self {
        Self::with_compressor(
            base_state,
            config,
            Arc::new(DeltaCompressor::new(config.strategy)),
        )
    }

    /// New chain sharing an existing compressor
    pub fn with_compressor(
        base_state: State,
        config: &DeltaConfig,
        compressor: Arc<DeltaCompressor>,
    ) -> Self {
        Self {
            current_state: base_state.clone(),
            base_state,
            deltas: Vec::new(),
            max_chain_length: config.max_chain_length.max(1),
            enable_rebase: config.enable_rebase,
            keep_recent: config.keep_recent,
            checkpoint_interval: config.checkpoint_interval,
            checkpoints: BTreeMap::new(),
            compressor,
            lifecycle: ChainState::Empty,
            optimizations: 0,
            rebaselines: 0,
            last_rebaseline: None,
        }
    }

    pub fn base_state(&self) -> &State {
        &self.base_state
    }

    pub fn deltas(&self) -> &[DeltaRecord] {
        &self.deltas
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn state(&self) -> ChainState {
        self.lifecycle
    }

    pub fn compressor(&self) -> &Arc<DeltaCompressor> {
        &self.compressor
    }

    /// Append a record, optimizing once the chain outgrows its bound
    pub fn add_delta(&mut self, delta: DeltaRecord) -> Result<()> {
        let next = self.compressor.apply_record(&self.current_state, &delta)?;
        self.deltas.push(delta);
        self.current_state = next;
        self.lifecycle = ChainState::Active;

        let len = self.deltas.len();
        if self.checkpoint_interval > 0 && len % self.checkpoint_interval == 0 {
            self.checkpoints.insert(len, self.current_state.clone());
        }

        if len > self.max_chain_length && self.enable_rebase {
            self.optimize_chain()?;
        }
        Ok(())
    }

    /// Diff `state` against the current state and append the result
    pub fn add_state(&mut self, state: &State, timestamp: Option<f64>) -> Result<DeltaRecord> {
        let info = self
            .compressor
            .calculate_delta(&self.current_state, state, false)?;
        let record = self.compressor.record_from_info(info, timestamp)?;
        self.add_delta(record.clone())?;
        Ok(record)
    }

    /// Replay the base through the first `index` deltas
    pub fn get_state_at_index(&self, index: usize) -> Result<State> {
        let length = self.deltas.len();
        if index > length {
            return Err(PersistError::ChainIndexOutOfRange { index, length });
        }
        if index == length {
            return Ok(self.current_state.clone());
        }

        let (start, mut state) = match self.checkpoints.range(..=index).next_back() {
            Some((at, state)) => (*at, state.clone()),
            None => (0, self.base_state.clone()),
        };
        for delta in &self.deltas[start..index] {
            state = self.compressor.apply_record(&state, delta)?;
        }
        Ok(state)
    }

    pub fn get_current_state(&self) -> State {
        self.current_state.clone()
    }

    /// Recompute the current state from the base, ignoring every cache
    pub fn replay_from_base(&self) -> Result<State> {
        let mut state = self.base_state.clone();
        for delta in &self.deltas {
            state = self.compressor.apply_record(&state, delta)?;
        }
        Ok(state)
    }

    /// Make the current state the new base and drop every delta
    pub fn rebaseline(&mut self) {
        let dropped = self.deltas.len();
        self.base_state = self.current_state.clone();
        self.deltas.clear();
        self.checkpoints.clear();
        self.lifecycle = ChainState::Rebased;
        self.rebaselines += 1;
        self.last_rebaseline = Some(timestamp());
        info!(dropped, "rebaselined delta chain");
    }

    /// Merge all but the most recent deltas into one record
    ///
    /// Returns false when there is nothing to merge. The final reconstructed
    /// state never changes; intermediate indices inside the merged block stop
    /// being addressable.
    pub fn optimize_chain(&mut self) -> Result<bool> {
        let keep = self
            .keep_recent
            .min(self.max_chain_length.saturating_sub(1));
        if self.deltas.len() <= keep + 1 {
            return Ok(false);
        }

        let split = self.deltas.len() - keep;
        let block = &self.deltas[..split];
        let merged = if block.iter().any(DeltaRecord::is_binary) {
            let target = self.get_state_at_index(split)?;
            let info = DeltaCompressor::dict_delta(&self.base_state, &target, false);
            let stamp = block.last().map(DeltaRecord::timestamp);
            self.compressor.record_from_info(info, stamp)?
        } else {
            match self.compressor.merge_deltas(block)? {
                Some(merged) => merged,
                None => return Ok(false),
            }
        };

        let merged_count = split;
        self.deltas.splice(..split, std::iter::once(merged));
        self.rebuild_checkpoints()?;
        self.lifecycle = ChainState::Optimized;
        self.optimizations += 1;

        debug!(
            merged = merged_count,
            chain_length = self.deltas.len(),
            "optimized delta chain"
        );
        Ok(true)
    }

    fn rebuild_checkpoints(&mut self) -> Result<()> {
        self.checkpoints.clear();
        if self.checkpoint_interval == 0 {
            return Ok(());
        }
        let mut state = self.base_state.clone();
        for (i, delta) in self.deltas.iter().enumerate() {
            state = self.compressor.apply_record(&state, delta)?;
            let at = i + 1;
            if at % self.checkpoint_interval == 0 && at < self.deltas.len() {
                self.checkpoints.insert(at, state.clone());
            }
        }
        Ok(())
    }

    pub fn get_chain_metrics(&self) -> ChainMetrics {
        ChainMetrics {
            chain_length: self.deltas.len(),
            max_chain_length: self.max_chain_length,
            replay_cost: self
                .deltas
                .iter()
                .map(|d| d.operation_count().max(1))
                .sum(),
            total_delta_bytes: self.deltas.iter().map(DeltaRecord::size_bytes).sum(),
            checkpoints: self.checkpoints.len(),
            optimizations: self.optimizations,
            rebaselines: self.rebaselines,
            last_rebaseline: self.last_rebaseline,
            state: self.lifecycle,
        }
    }
}
