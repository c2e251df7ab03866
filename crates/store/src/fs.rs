use std::fs::ReadDir;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use craftblock_core::content_id;
use craftblock_core::{Block, Cid, Context, CraftBlockError, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{keys_until_done, BlockStore, KeyStream, StoreOptions};

/// Filesystem block store.
///
/// Each block lives in `blocks/<shard>/<hex>` where `hex` is the hex of the
/// CID's binary form and `shard` its next-to-last two hex characters.
/// Writes go through a temp file and rename, one writer at a time.
#[derive(Debug)]
pub struct FsStore {
    repo_dir: PathBuf,
    blocks_dir: PathBuf,
    options: StoreOptions,
    write_lock: Mutex<()>,
}

fn shard_of(hex: &str) -> &str {
    let len = hex.len();
    if len < 3 {
        return "_";
    }
    &hex[len - 3..len - 1]
}

impl FsStore {
    pub fn open(repo_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with(repo_dir, StoreOptions::default())
    }

    pub fn open_with(repo_dir: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let repo_dir = repo_dir.into();
        let blocks_dir = repo_dir.join("blocks");
        std::fs::create_dir_all(&blocks_dir)?;
        Ok(Self {
            repo_dir,
            blocks_dir,
            options,
            write_lock: Mutex::new(()),
        })
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    fn block_path(&self, cid: &Cid) -> PathBuf {
        let hex = content_id::to_hex(cid);
        self.blocks_dir.join(shard_of(&hex)).join(hex)
    }
}

impl BlockStore for FsStore {
    fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.block_path(cid).is_file())
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        let data = match std::fs::read(self.block_path(cid)) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CraftBlockError::NotFound(*cid))
            }
            Err(e) => return Err(e.into()),
        };
        let block = Block::new_unchecked(*cid, data);
        if self.options.hash_on_read {
            block.verify()?;
        }
        Ok(block)
    }

    fn get_size(&self, cid: &Cid) -> Result<usize> {
        match std::fs::metadata(self.block_path(cid)) {
            Ok(meta) => Ok(meta.len() as usize),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(CraftBlockError::NotFound(*cid)),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, block: &Block) -> Result<()> {
        if !self.options.trust {
            block.verify()?;
        }
        let path = self.block_path(block.cid());
        let _guard = self.write_lock.lock();
        if path.is_file() {
            return Ok(());
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, block.data())?;
        std::fs::rename(&tmp, &path)?;
        debug!("Stored block {} ({} bytes)", block.cid(), block.len());
        Ok(())
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        let _guard = self.write_lock.lock();
        match std::fs::remove_file(self.block_path(cid)) {
            Ok(()) => {
                debug!("Deleted block {}", cid);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn all_keys(&self, ctx: &Context) -> Result<KeyStream> {
        let shards = std::fs::read_dir(&self.blocks_dir)?;
        Ok(keys_until_done(
            ctx,
            FsKeys {
                shards,
                current: None,
            },
        ))
    }
}

/// Walks shard directories lazily, one directory handle at a time.
struct FsKeys {
    shards: ReadDir,
    current: Option<ReadDir>,
}

impl Iterator for FsKeys {
    type Item = Cid;

    fn next(&mut self) -> Option<Cid> {
        loop {
            if let Some(entries) = self.current.as_mut() {
                match entries.next() {
                    Some(Ok(entry)) => {
                        let name = entry.file_name();
                        let name = name.to_string_lossy();
                        if name.ends_with(".tmp") {
                            continue;
                        }
                        match content_id::from_hex(&name) {
                            Ok(cid) => return Some(cid),
                            Err(e) => {
                                warn!("Skipping unparseable block file {}: {}", name, e);
                                continue;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Error reading shard directory: {}", e);
                        continue;
                    }
                    None => self.current = None,
                }
            }
            let shard = self.shards.next()?;
            match shard.and_then(|s| std::fs::read_dir(s.path())) {
                Ok(entries) => self.current = Some(entries),
                Err(e) => warn!("Error opening shard: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn test_store() -> (FsStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FsStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_put_and_get_block() {
        let (store, _dir) = test_store();
        let block = Block::new(&b"on disk"[..]);
        store.put(&block).unwrap();
        assert!(store.has(block.cid()).unwrap());
        assert_eq!(store.get(block.cid()).unwrap(), block);
        assert_eq!(store.get_size(block.cid()).unwrap(), 7);
    }

    #[test]
    fn test_layout() {
        let (store, dir) = test_store();
        let block = Block::new(&b"layout"[..]);
        store.put(&block).unwrap();
        let hex = content_id::to_hex(block.cid());
        let path = dir.path().join("blocks").join(shard_of(&hex)).join(&hex);
        assert_eq!(std::fs::read(path).unwrap(), b"layout");
    }

    #[test]
    fn test_missing_block() {
        let (store, _dir) = test_store();
        let cid = *Block::new(&b"absent"[..]).cid();
        assert!(store.get(&cid).unwrap_err().is_not_found());
        assert!(store.get_size(&cid).unwrap_err().is_not_found());
        store.delete(&cid).unwrap();
    }

    #[test]
    fn test_rejects_mismatch() {
        let (store, _dir) = test_store();
        let cid = *Block::new(&b"honest"[..]).cid();
        assert!(store.put(&Block::new_unchecked(cid, &b"liar"[..])).is_err());
        assert!(!store.has(&cid).unwrap());
    }

    #[test]
    fn test_reopen_sees_blocks() {
        let dir = TempDir::new().unwrap();
        let block = Block::raw(&b"persist"[..]);
        FsStore::open(dir.path()).unwrap().put(&block).unwrap();
        let reopened = FsStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get(block.cid()).unwrap(), block);
    }

    #[tokio::test]
    async fn test_all_keys_walks_shards() {
        let (store, _dir) = test_store();
        let mut expected = Vec::new();
        for i in 0..50u8 {
            let block = Block::new(vec![i, i]);
            store.put(&block).unwrap();
            expected.push(*block.cid());
        }
        let mut keys: Vec<Cid> = store.all_keys(&Context::background()).unwrap().collect().await;
        keys.sort();
        expected.sort();
        assert_eq!(keys, expected);
    }
}
