//! Server side bookkeeping: which peers want which blocks from us.

use std::collections::{HashMap, HashSet};

use craftblock_core::Cid;
use libp2p::PeerId;
use parking_lot::Mutex;

#[derive(Default)]
pub(crate) struct Ledger {
    wants: Mutex<HashMap<PeerId, HashSet<Cid>>>,
}

impl Ledger {
    pub(crate) fn add(&self, peer: PeerId, cid: Cid) -> bool {
        self.wants.lock().entry(peer).or_default().insert(cid)
    }

    /// Remove one want; true if it was present. Empty wantlists are dropped.
    pub(crate) fn remove(&self, peer: &PeerId, cid: &Cid) -> bool {
        let mut wants = self.wants.lock();
        let Some(set) = wants.get_mut(peer) else {
            return false;
        };
        let removed = set.remove(cid);
        if set.is_empty() {
            wants.remove(peer);
        }
        removed
    }

    /// Remove `cid` from every wantlist, returning the peers that wanted it.
    pub(crate) fn take_wanting(&self, cid: &Cid) -> Vec<PeerId> {
        let mut wants = self.wants.lock();
        let mut peers = Vec::new();
        wants.retain(|peer, set| {
            if set.remove(cid) {
                peers.push(*peer);
            }
            !set.is_empty()
        });
        peers
    }

    pub(crate) fn remove_peer(&self, peer: &PeerId) -> usize {
        self.wants.lock().remove(peer).map(|s| s.len()).unwrap_or(0)
    }

    pub(crate) fn wantlist(&self, peer: &PeerId) -> Vec<Cid> {
        self.wants
            .lock()
            .get(peer)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.wants.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craftblock_core::Block;

    fn cid(n: u8) -> Cid {
        *Block::new(vec![n]).cid()
    }

    #[test]
    fn test_add_and_remove() {
        let ledger = Ledger::default();
        let peer = PeerId::random();
        assert!(ledger.add(peer, cid(1)));
        assert!(!ledger.add(peer, cid(1)));
        assert_eq!(ledger.wantlist(&peer), vec![cid(1)]);

        assert!(ledger.remove(&peer, &cid(1)));
        assert!(!ledger.remove(&peer, &cid(1)));
        assert_eq!(ledger.peer_count(), 0);
    }

    #[test]
    fn test_take_wanting() {
        let ledger = Ledger::default();
        let a = PeerId::random();
        let b = PeerId::random();
        ledger.add(a, cid(1));
        ledger.add(b, cid(1));
        ledger.add(b, cid(2));

        let mut wanting = ledger.take_wanting(&cid(1));
        wanting.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(wanting, expected);

        assert!(ledger.wantlist(&a).is_empty());
        assert_eq!(ledger.wantlist(&b), vec![cid(2)]);
        assert_eq!(ledger.peer_count(), 1);
    }

    #[test]
    fn test_remove_peer() {
        let ledger = Ledger::default();
        let peer = PeerId::random();
        ledger.add(peer, cid(1));
        ledger.add(peer, cid(2));
        assert_eq!(ledger.remove_peer(&peer), 2);
        assert_eq!(ledger.peer_count(), 0);
    }
}
