use craftblock_core::content_id::is_identity;
use craftblock_core::{Block, Cid, Context, Result};

use crate::{BlockStore, KeyStream};

/// Resolves identity CIDs without touching the inner store.
///
/// For an identity CID `has` is true, `get` synthesizes the block from the
/// digest and `put`/`delete` succeed without doing anything. Every other
/// CID passes straight through.
#[derive(Debug)]
pub struct IdentityStore<S> {
    inner: S,
}

impl<S: BlockStore> IdentityStore<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: BlockStore> BlockStore for IdentityStore<S> {
    fn has(&self, cid: &Cid) -> Result<bool> {
        if is_identity(cid) {
            return Ok(true);
        }
        self.inner.has(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        match Block::from_identity(cid) {
            Some(block) => Ok(block),
            None => self.inner.get(cid),
        }
    }

    fn get_size(&self, cid: &Cid) -> Result<usize> {
        if is_identity(cid) {
            return Ok(cid.hash().digest().len());
        }
        self.inner.get_size(cid)
    }

    fn put(&self, block: &Block) -> Result<()> {
        if is_identity(block.cid()) {
            return Ok(());
        }
        self.inner.put(block)
    }

    fn put_many(&self, blocks: &[Block]) -> Result<()> {
        let rest: Vec<Block> = blocks
            .iter()
            .filter(|b| !is_identity(b.cid()))
            .cloned()
            .collect();
        self.inner.put_many(&rest)
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        if is_identity(cid) {
            return Ok(());
        }
        self.inner.delete(cid)
    }

    fn all_keys(&self, ctx: &Context) -> Result<KeyStream> {
        self.inner.all_keys(ctx)
    }
}
