use std::collections::HashMap;

use bytes::Bytes;
use craftblock_core::{Block, Cid, Context, CraftBlockError, Result};
use parking_lot::RwLock;

use crate::{keys_until_done, BlockStore, KeyStream, StoreOptions};

/// In-memory block store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blocks: RwLock<HashMap<Cid, Bytes>>,
    options: StoreOptions,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: StoreOptions) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            options,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

impl BlockStore for MemoryStore {
    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.blocks.read().contains_key(cid))
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        let data = self
            .blocks
            .read()
            .get(cid)
            .cloned()
            .ok_or(CraftBlockError::NotFound(*cid))?;
        let block = Block::new_unchecked(*cid, data);
        if self.options.hash_on_read {
            block.verify()?;
        }
        Ok(block)
    }

    fn get_size(&self, cid: &Cid) -> Result<usize> {
        self.blocks
            .read()
            .get(cid)
            .map(|d| d.len())
            .ok_or(CraftBlockError::NotFound(*cid))
    }

    fn put(&self, block: &Block) -> Result<()> {
        if !self.options.trust {
            block.verify()?;
        }
        self.blocks
            .write()
            .entry(*block.cid())
            .or_insert_with(|| block.data().clone());
        Ok(())
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        self.blocks.write().remove(cid);
        Ok(())
    }

    fn all_keys(&self, ctx: &Context) -> Result<KeyStream> {
        let keys: Vec<Cid> = self.blocks.read().keys().copied().collect();
        Ok(keys_until_done(ctx, keys))
    }
}
