use craftblock_core::content_id::other_versions;
use craftblock_core::{Block, Cid, Context, Result};
use tracing::{debug, warn};

use crate::{BlockStore, KeyStream};

/// Consults the equivalent key of the other CID version on a miss.
///
/// A hit under the alternate key is returned addressed by the requested CID.
/// With `rewrite` set the block is also stored under the requested CID so the
/// next read hits directly.
#[derive(Debug)]
pub struct VersionedStore<S> {
    inner: S,
    rewrite: bool,
}

impl<S: BlockStore> VersionedStore<S> {
    pub fn new(inner: S, rewrite: bool) -> Self {
        Self { inner, rewrite }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn lookup_alternate(&self, cid: &Cid) -> Result<Option<Block>> {
        for alt in other_versions(cid) {
            match self.inner.get(&alt) {
                Ok(found) => {
                    debug!("Resolved {} via equivalent key {}", cid, alt);
                    let block = found.with_alias(*cid);
                    if self.rewrite {
                        if let Err(e) = self.inner.put(&block) {
                            warn!("Failed to rewrite {} under requested version: {}", cid, e);
                        }
                    }
                    return Ok(Some(block));
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl<S: BlockStore> BlockStore for VersionedStore<S> {
    fn has(&self, cid: &Cid) -> Result<bool> {
        if self.inner.has(cid)? {
            return Ok(true);
        }
        for alt in other_versions(cid) {
            if self.inner.has(&alt)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        match self.inner.get(cid) {
            Err(e) if e.is_not_found() => match self.lookup_alternate(cid)? {
                Some(block) => Ok(block),
                None => Err(e),
            },
            other => other,
        }
    }

    fn get_size(&self, cid: &Cid) -> Result<usize> {
        match self.inner.get_size(cid) {
            Err(e) if e.is_not_found() => {
                for alt in other_versions(cid) {
                    match self.inner.get_size(&alt) {
                        Ok(size) => return Ok(size),
                        Err(alt_err) if alt_err.is_not_found() => continue,
                        Err(alt_err) => return Err(alt_err),
                    }
                }
                Err(e)
            }
            other => other,
        }
    }

    fn put(&self, block: &Block) -> Result<()> {
        self.inner.put(block)
    }

    fn put_many(&self, blocks: &[Block]) -> Result<()> {
        self.inner.put_many(blocks)
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        self.inner.delete(cid)
    }

    fn all_keys(&self, ctx: &Context) -> Result<KeyStream> {
        self.inner.all_keys(ctx)
    }
}
