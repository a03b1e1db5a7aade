//! Test fixtures: a scriptable chain engine and block builders.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::blockchain::{BlockHeader, ChainEngine};
use crate::codec::{Checksum256, Packable};
use crate::error::ChainError;

/// Builds `count` linked raw blocks on top of (`parent_id`, `parent_num`).
pub fn build_chain(parent_id: Checksum256, parent_num: u32, count: u32) -> Vec<Vec<u8>> {
    let mut previous = parent_id;
    let mut out = Vec::new();
    for i in 0..count {
        let header = BlockHeader {
            timestamp: parent_num + i + 1,
            producer: 0,
            confirmed: 0,
            previous,
            transaction_mroot: Checksum256::empty(),
            action_mroot: Checksum256::empty(),
            schedule_version: 0,
            new_producers: None,
            header_extensions: Vec::new(),
        };
        debug_assert_eq!(header.block_num(), parent_num + i + 1);
        previous = header.calculate_id();
        let mut raw = header.to_bytes();
        // producer signature and empty transaction/extension lists
        raw.extend_from_slice(&[0u8; 66]);
        raw.extend_from_slice(&[0, 0]);
        out.push(raw);
    }
    out
}

/// A single raw block numbered `num`, whose parent id carries `num - 1`.
pub fn block_at(num: u32) -> Vec<u8> {
    let parent = crate::blockchain::make_block_id(num - 1);
    build_chain(parent, num - 1, 1).remove(0)
}

pub fn block_id(raw: &[u8]) -> Checksum256 {
    BlockHeader::from_bytes(raw).map(|h| h.calculate_id()).unwrap_or_default()
}

#[derive(Debug, Default)]
pub struct MockState {
    pub head_num: u32,
    pub head_id: Checksum256,
    pub lib_num: u32,
    pub lib_id: Checksum256,
    pub earliest: u32,
    pub ids: BTreeMap<u32, Checksum256>,
    pub blocks: BTreeMap<u32, Vec<u8>>,
    pub pushed: Vec<Vec<u8>>,
    /// Returned by the next push instead of applying the block.
    pub push_error: Option<ChainError>,
}

/// Chain engine whose state tests set directly; every push is recorded.
#[derive(Debug, Default)]
pub struct MockChain {
    pub state: Mutex<MockState>,
}

impl MockChain {
    pub fn with_head(head_num: u32, head_id: Checksum256) -> Self {
        let chain = Self::default();
        {
            let mut state = chain.state.lock().unwrap();
            state.head_num = head_num;
            state.head_id = head_id;
            state.ids.insert(head_num, head_id);
            state.earliest = 1;
        }
        chain
    }

    pub fn set_lib(&self, lib_num: u32, lib_id: Checksum256) {
        let mut state = self.state.lock().unwrap();
        state.lib_num = lib_num;
        state.lib_id = lib_id;
    }

    pub fn set_block(&self, num: u32, raw: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.ids.insert(num, block_id(&raw));
        state.blocks.insert(num, raw);
    }

    pub fn fail_next_push(&self, err: ChainError) {
        self.state.lock().unwrap().push_error = Some(err);
    }

    pub fn push_count(&self) -> usize {
        self.state.lock().unwrap().pushed.len()
    }
}

impl ChainEngine for MockChain {
    fn chain_id(&self) -> Checksum256 {
        Checksum256([0xcc; 32])
    }

    fn head_block_num(&self) -> u32 {
        self.state.lock().unwrap().head_num
    }

    fn head_block_id(&self) -> Checksum256 {
        self.state.lock().unwrap().head_id
    }

    fn last_irreversible_block_num(&self) -> u32 {
        self.state.lock().unwrap().lib_num
    }

    fn last_irreversible_block_id(&self) -> Checksum256 {
        self.state.lock().unwrap().lib_id
    }

    fn get_block_id_for_num(&self, num: u32) -> Option<Checksum256> {
        self.state.lock().unwrap().ids.get(&num).copied()
    }

    fn fetch_block_by_number(&self, num: u32) -> Option<Vec<u8>> {
        self.state.lock().unwrap().blocks.get(&num).cloned()
    }

    fn earliest_available_block_num(&self) -> u32 {
        self.state.lock().unwrap().earliest
    }

    fn push_block(&self, raw_block: &[u8], _want_statistics: bool) -> Result<Option<String>, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.pushed.push(raw_block.to_vec());
        if let Some(err) = state.push_error.take() {
            return Err(err);
        }
        let header = BlockHeader::from_bytes(raw_block).map_err(|e| ChainError::Other(e.to_string()))?;
        let id = header.calculate_id();
        state.head_num = header.block_num();
        state.head_id = id;
        let num = state.head_num;
        state.ids.insert(num, id);
        Ok(None)
    }
}
