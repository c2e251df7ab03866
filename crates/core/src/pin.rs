//! Recursive pin set: CID → maximum traversal depth.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use cid::Cid;
use serde::{Deserialize, Serialize};

use crate::content_id;
use crate::Result;

/// Depth value meaning "no limit".
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecursivePins {
    pins: HashMap<Cid, i64>,
}

/// On-disk form: hex CID → depth, sorted for stable output.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PinFile {
    recursive: BTreeMap<String, i64>,
}

/// Whether `new` reaches further than `old`. Negative depths are unlimited.
fn is_deeper(new: i64, old: i64) -> bool {
    if old < 0 {
        return false;
    }
    new < 0 || new > old
}

impl RecursivePins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `cid` pinned to `depth`. Only ever deepens an existing entry;
    /// returns true if anything changed.
    pub fn visit(&mut self, cid: Cid, depth: i64) -> bool {
        match self.pins.get_mut(&cid) {
            Some(old) if is_deeper(depth, *old) => {
                *old = depth;
                true
            }
            Some(_) => false,
            None => {
                self.pins.insert(cid, depth);
                true
            }
        }
    }

    pub fn depth(&self, cid: &Cid) -> Option<i64> {
        self.pins.get(cid).copied()
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.pins.contains_key(cid)
    }

    pub fn remove(&mut self, cid: &Cid) -> Option<i64> {
        self.pins.remove(cid)
    }

    pub fn keys(&self) -> impl Iterator<Item = &Cid> {
        self.pins.keys()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        let file = PinFile {
            recursive: self
                .pins
                .iter()
                .map(|(c, d)| (content_id::to_hex(c), *d))
                .collect(),
        };
        serde_json::to_string_pretty(&file)
            .map_err(|e| crate::CraftBlockError::Storage(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: PinFile = serde_json::from_str(json)
            .map_err(|e| crate::CraftBlockError::Storage(e.to_string()))?;
        let mut pins = HashMap::with_capacity(file.recursive.len());
        for (hex, depth) in file.recursive {
            pins.insert(content_id::from_hex(&hex)?, depth);
        }
        Ok(Self { pins })
    }

    /// Load from `path`; a missing file is an empty set.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Write atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, self.to_json()?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Block;

    fn cid(n: u8) -> Cid {
        *Block::new(vec![n]).cid()
    }

    #[test]
    fn test_visit_is_monotone() {
        let mut pins = RecursivePins::new();
        let c = cid(1);

        assert!(pins.visit(c, 2));
        assert!(!pins.visit(c, 1));
        assert!(!pins.visit(c, 2));
        assert_eq!(pins.depth(&c), Some(2));

        assert!(pins.visit(c, 5));
        assert_eq!(pins.depth(&c), Some(5));
    }

    #[test]
    fn test_unlimited_is_deepest() {
        let mut pins = RecursivePins::new();
        let c = cid(2);
        pins.visit(c, 3);
        assert!(pins.visit(c, UNLIMITED));
        assert!(!pins.visit(c, 1_000_000));
        assert!(!pins.visit(c, UNLIMITED));
        assert_eq!(pins.depth(&c), Some(UNLIMITED));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pins.json");
        assert!(RecursivePins::load(&path).unwrap().is_empty());

        let mut pins = RecursivePins::new();
        pins.visit(cid(1), 0);
        pins.visit(cid(2), UNLIMITED);
        pins.save(&path).unwrap();

        let loaded = RecursivePins::load(&path).unwrap();
        assert_eq!(loaded, pins);
        assert!(!dir.path().join("pins.json.tmp").exists());
    }

    #[test]
    fn test_remove() {
        let mut pins = RecursivePins::new();
        pins.visit(cid(3), 1);
        assert_eq!(pins.remove(&cid(3)), Some(1));
        assert!(!pins.contains(&cid(3)));
        assert_eq!(pins.len(), 0);
    }
}
