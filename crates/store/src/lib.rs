//! CraftBlock Store
//!
//! Content-addressed block storage.
//!
//! [`BlockStore`] is the only interface the exchange sees. Concrete stores
//! ([`MemoryStore`], [`FsStore`]) are wrapped by decorators that add identity
//! CID resolution ([`IdentityStore`]) and CIDv0/CIDv1 equivalence
//! ([`VersionedStore`]).
//!
//! Filesystem layout:
//! ```text
//! <repo_dir>/
//!   blocks/<shard>/<cid_hex>
//! ```

mod fs;
mod handles;
mod identity;
mod memory;
mod versioned;

use std::sync::Arc;

use craftblock_core::{Block, Cid, Context, Result};
use futures::stream::{self, BoxStream, StreamExt};

pub use fs::FsStore;
pub use handles::RepoHandles;
pub use identity::IdentityStore;
pub use memory::MemoryStore;
pub use versioned::VersionedStore;

/// Lazy, finite stream of keys. Ends early when its context completes.
pub type KeyStream = BoxStream<'static, Cid>;

/// Behaviour switches shared by the concrete stores.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    /// Verify block hashes on every read.
    pub hash_on_read: bool,
    /// Accept blocks on `put` without verifying their hash.
    pub trust: bool,
}

pub trait BlockStore: Send + Sync {
    fn has(&self, cid: &Cid) -> Result<bool>;

    /// Fails with [`craftblock_core::CraftBlockError::NotFound`] when absent.
    fn get(&self, cid: &Cid) -> Result<Block>;

    fn get_size(&self, cid: &Cid) -> Result<usize> {
        self.get(cid).map(|b| b.len())
    }

    /// Idempotent on the block's CID.
    fn put(&self, block: &Block) -> Result<()>;

    /// Stops at, and reports, the first failure.
    fn put_many(&self, blocks: &[Block]) -> Result<()> {
        for block in blocks {
            self.put(block)?;
        }
        Ok(())
    }

    fn delete(&self, cid: &Cid) -> Result<()>;

    fn all_keys(&self, ctx: &Context) -> Result<KeyStream>;
}

impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    fn has(&self, cid: &Cid) -> Result<bool> {
        (**self).has(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        (**self).get(cid)
    }

    fn get_size(&self, cid: &Cid) -> Result<usize> {
        (**self).get_size(cid)
    }

    fn put(&self, block: &Block) -> Result<()> {
        (**self).put(block)
    }

    fn put_many(&self, blocks: &[Block]) -> Result<()> {
        (**self).put_many(blocks)
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        (**self).delete(cid)
    }

    fn all_keys(&self, ctx: &Context) -> Result<KeyStream> {
        (**self).all_keys(ctx)
    }
}

/// Wrap an iterator of keys so it stops yielding once `ctx` completes.
pub fn keys_until_done<I>(ctx: &Context, keys: I) -> KeyStream
where
    I: IntoIterator<Item = Cid>,
    I::IntoIter: Send + 'static,
{
    stream::iter(keys)
        .take_until(ctx.clone().done_owned())
        .boxed()
}

/// The decorator stack a node serves from: identity CIDs first, then
/// cross-version lookups, then the backing store.
pub fn layered<S: BlockStore>(inner: S, rewrite: bool) -> IdentityStore<VersionedStore<S>> {
    IdentityStore::new(VersionedStore::new(inner, rewrite))
}
