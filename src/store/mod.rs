//! Content-addressed block storage.
//!
//! The store is the local source of truth. A miss is reported as
//! `RecoveryError::NotFound`, which is what the self-healing layers react
//! to; any other error is passed through untouched.

pub mod fs;

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::cid::Cid;
use crate::error::{RecoveryError, Result};
use crate::node::Block;

pub use fs::FsBlockStore;

pub trait BlockStore: Send + Sync {
    /// Fetch a block, or `NotFound`.
    fn get(&self, cid: &Cid) -> Result<Block>;

    /// Store a block. Storing an existing block is a no-op.
    fn put(&self, block: &Block) -> Result<()>;

    fn has(&self, cid: &Cid) -> Result<bool>;

    /// Remove a block. Removing an absent block is not an error.
    fn delete(&self, cid: &Cid) -> Result<()>;

    fn put_many(&self, blocks: &[Block]) -> Result<()> {
        for block in blocks {
            self.put(block)?;
        }
        Ok(())
    }
}

// ── MemoryBlockStore ───────────────────────────────────────────────

/// In-memory store for tests and ephemeral use.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, cid: &Cid) -> Result<Block> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks
            .get(cid)
            .map(|data| Block::with_cid(*cid, data.clone()))
            .ok_or(RecoveryError::NotFound(*cid))
    }

    fn put(&self, block: &Block) -> Result<()> {
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(*block.cid())
            .or_insert_with(|| block.data().to_vec());
        Ok(())
    }

    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(cid))
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryBlockStore::new();
        let block = Node::raw("1234567890").to_block();

        assert!(matches!(
            store.get(block.cid()),
            Err(RecoveryError::NotFound(_))
        ));

        store.put(&block).unwrap();
        assert!(store.has(block.cid()).unwrap());
        assert_eq!(store.get(block.cid()).unwrap(), block);

        store.delete(block.cid()).unwrap();
        store.delete(block.cid()).unwrap();
        assert!(!store.has(block.cid()).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_put_many() {
        let store = MemoryBlockStore::new();
        let blocks: Vec<Block> = ["a", "b", "a"]
            .iter()
            .map(|s| Node::raw(*s).to_block())
            .collect();
        store.put_many(&blocks).unwrap();
        assert_eq!(store.len(), 2);
    }
}
