//! The chain engine as seen by the sync client.
//!
//! Validation, execution and storage live behind [`ChainEngine`]. The sync
//! client only reads head/LIB state, fetches stored blocks to serve peers,
//! and pushes received blocks.

pub mod block;
pub mod chain;

use std::sync::Arc;

use crate::codec::Checksum256;
use crate::error::ChainError;

pub use block::{make_block_id, BlockHeader};
pub use chain::MemoryChain;

/// Lock shared with other consumers of chain state; held for writing around every push.
pub type ChainLock = Arc<tokio::sync::RwLock<()>>;

pub trait ChainEngine: Send + Sync {
    fn chain_id(&self) -> Checksum256;
    fn head_block_num(&self) -> u32;
    fn head_block_id(&self) -> Checksum256;
    fn last_irreversible_block_num(&self) -> u32;
    fn last_irreversible_block_id(&self) -> Checksum256;
    fn get_block_id_for_num(&self, num: u32) -> Option<Checksum256>;
    fn fetch_block_by_number(&self, num: u32) -> Option<Vec<u8>>;
    fn earliest_available_block_num(&self) -> u32;

    /// Applies a packed signed block. When `want_statistics` is set the engine
    /// may return a human readable summary of the work done.
    fn push_block(&self, raw_block: &[u8], want_statistics: bool) -> Result<Option<String>, ChainError>;
}
