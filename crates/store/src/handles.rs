use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use craftblock_core::Result;
use parking_lot::Mutex;
use tracing::debug;

/// Reference-counted open repositories keyed by path.
///
/// Opening a path that is already open hands back the existing handle; the
/// handle is released only when every opener has closed it.
pub struct RepoHandles<T> {
    open: Mutex<HashMap<PathBuf, (usize, Arc<T>)>>,
}

impl<T> RepoHandles<T> {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Return the handle for `path`, running `opener` only on first open.
    pub fn open<F>(&self, path: &Path, opener: F) -> Result<Arc<T>>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let mut open = self.open.lock();
        if let Some((count, handle)) = open.get_mut(path) {
            *count += 1;
            return Ok(handle.clone());
        }
        let handle = Arc::new(opener(path)?);
        open.insert(path.to_path_buf(), (1, handle.clone()));
        debug!("Opened repo {}", path.display());
        Ok(handle)
    }

    /// Drop one reference. Returns true when this was the last one and the
    /// repo was released.
    pub fn close(&self, path: &Path) -> bool {
        let mut open = self.open.lock();
        let Some((count, _)) = open.get_mut(path) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        open.remove(path);
        debug!("Released repo {}", path.display());
        true
    }

    pub fn count(&self, path: &Path) -> usize {
        self.open.lock().get(path).map(|(c, _)| *c).unwrap_or(0)
    }
}

impl<T> Default for RepoHandles<T> {
    fn default() -> Self {
        Self::new()
    }
}
