//! In-process chain engine.
//!
//! `MemoryChain` links blocks by their header `previous` id and keeps the raw
//! payloads so they can be served back to peers. It does not execute
//! transactions or verify signatures; it exists so the sync client can run
//! and be tested without a native node.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::info;

use super::block::BlockHeader;
use super::ChainEngine;
use crate::codec::{Checksum256, Packable};
use crate::error::ChainError;

pub const DEFAULT_IRREVERSIBLE_DEPTH: u32 = 12;
/// Irreversible blocks kept for serving peers: about 14 hours at two blocks per second.
pub const DEFAULT_RETAINED_BLOCKS: u32 = 100_000;

/// A block accepted into the chain.
#[derive(Clone, Debug)]
struct StoredBlock {
    id: Checksum256,
    raw: Vec<u8>,
}

#[derive(Debug, Default)]
struct ChainState {
    /// Block number -> block, contiguous from the first pushed block up to head.
    blocks: BTreeMap<u32, StoredBlock>,
    head_num: u32,
    head_id: Checksum256,
}

/// Memory is bounded: only the reversible tail plus `retained_blocks`
/// irreversible blocks are stored, older ones are pruned on push.
#[derive(Debug)]
pub struct MemoryChain {
    chain_id: Checksum256,
    /// Blocks this far below head are treated as irreversible.
    irreversible_depth: u32,
    retained_blocks: u32,
    state: RwLock<ChainState>,
}

impl MemoryChain {
    /// Creates an empty chain whose head is block 0 with an all-zero id.
    pub fn new(chain_id: Checksum256) -> Self {
        Self::with_irreversible_depth(chain_id, DEFAULT_IRREVERSIBLE_DEPTH)
    }

    pub fn with_irreversible_depth(chain_id: Checksum256, irreversible_depth: u32) -> Self {
        Self {
            chain_id,
            irreversible_depth,
            retained_blocks: DEFAULT_RETAINED_BLOCKS,
            state: RwLock::new(ChainState::default()),
        }
    }

    /// Starts the chain at an existing block, as if restored from a snapshot.
    pub fn from_snapshot(chain_id: Checksum256, head_num: u32, head_id: Checksum256) -> Self {
        let chain = Self::new(chain_id);
        {
            let mut state = chain.write_state();
            state.head_num = head_num;
            state.head_id = head_id;
        }
        chain
    }

    /// Keeps at most `retained_blocks` blocks below the last irreversible block.
    pub fn with_retention(mut self, retained_blocks: u32) -> Self {
        self.retained_blocks = retained_blocks;
        self
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn block_count(&self) -> usize {
        self.read_state().blocks.len()
    }
}

impl ChainEngine for MemoryChain {
    fn chain_id(&self) -> Checksum256 {
        self.chain_id
    }

    fn head_block_num(&self) -> u32 {
        self.read_state().head_num
    }

    fn head_block_id(&self) -> Checksum256 {
        self.read_state().head_id
    }

    fn last_irreversible_block_num(&self) -> u32 {
        self.read_state().head_num.saturating_sub(self.irreversible_depth)
    }

    fn last_irreversible_block_id(&self) -> Checksum256 {
        let lib = self.last_irreversible_block_num();
        self.get_block_id_for_num(lib).unwrap_or_default()
    }

    fn get_block_id_for_num(&self, num: u32) -> Option<Checksum256> {
        let state = self.read_state();
        if num == state.head_num {
            return Some(state.head_id);
        }
        state.blocks.get(&num).map(|b| b.id)
    }

    fn fetch_block_by_number(&self, num: u32) -> Option<Vec<u8>> {
        self.read_state().blocks.get(&num).map(|b| b.raw.clone())
    }

    fn earliest_available_block_num(&self) -> u32 {
        let state = self.read_state();
        state
            .blocks
            .keys()
            .next()
            .copied()
            .unwrap_or(state.head_num.saturating_add(1))
    }

    fn push_block(&self, raw_block: &[u8], want_statistics: bool) -> Result<Option<String>, ChainError> {
        let header = BlockHeader::from_bytes(raw_block)
            .map_err(|e| ChainError::Other(format!("malformed block header: {}", e)))?;
        let num = header.block_num();
        let id = header.calculate_id();

        let mut state = self.write_state();
        if state.blocks.get(&num).map(|b| b.id) == Some(id) {
            return Err(ChainError::ForkDatabase(format!(
                "{}: {}",
                ChainError::ALREADY_KNOWN,
                id
            )));
        }
        if header.previous != state.head_id || num != state.head_num.wrapping_add(1) {
            return Err(ChainError::UnlinkableBlock);
        }

        state.blocks.insert(num, StoredBlock { id, raw: raw_block.to_vec() });
        state.head_num = num;
        state.head_id = id;

        let floor = num
            .saturating_sub(self.irreversible_depth)
            .saturating_sub(self.retained_blocks);
        if state.blocks.keys().next().map_or(false, |first| *first < floor) {
            state.blocks = state.blocks.split_off(&floor);
        }

        if want_statistics {
            let stats = format!("applied block {} ({} bytes), id: {}", num, raw_block.len(), id);
            info!("{}", stats);
            return Ok(Some(stats));
        }
        Ok(None)
    }
}
