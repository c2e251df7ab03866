//! One-shot block notifications keyed by CID.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use craftblock_core::{Block, Cid, Context, CraftBlockError, Result};
use parking_lot::Mutex;
use tokio::sync::oneshot;

#[derive(Default)]
struct BusState {
    subscribers: HashMap<Cid, Vec<(u64, oneshot::Sender<Block>)>>,
    next_id: u64,
    closed: bool,
}

/// Fan-out of arriving blocks to whoever is waiting on their CID.
///
/// Publishing never blocks and never waits on subscribers. A subscription
/// registered before a publish is guaranteed to receive it.
#[derive(Clone, Default)]
pub struct Notifications {
    state: Arc<Mutex<BusState>>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, cid: Cid) -> Subscription {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        if !state.closed {
            state.subscribers.entry(cid).or_default().push((id, tx));
        }
        Subscription {
            cid,
            id,
            rx,
            bus: Arc::downgrade(&self.state),
        }
    }

    /// Deliver `block` to every current subscriber of its CID. Returns how
    /// many were waiting.
    pub fn publish(&self, block: &Block) -> usize {
        let waiting = self.state.lock().subscribers.remove(block.cid());
        let Some(waiting) = waiting else {
            return 0;
        };
        let count = waiting.len();
        for (_, tx) in waiting {
            let _ = tx.send(block.clone());
        }
        count
    }

    /// Close every outstanding subscription. Later subscriptions are closed on
    /// creation.
    pub fn shutdown(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        drop(drained);
    }

    pub fn subscriber_count(&self, cid: &Cid) -> usize {
        self.state
            .lock()
            .subscribers
            .get(cid)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

/// Yields at most one block. Unsubscribes on drop.
pub struct Subscription {
    cid: Cid,
    id: u64,
    rx: oneshot::Receiver<Block>,
    bus: Weak<Mutex<BusState>>,
}

impl Subscription {
    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// The published block, or `None` once the bus shut down.
    pub async fn recv(&mut self) -> Option<Block> {
        (&mut self.rx).await.ok()
    }

    /// Wait for the block or for `ctx` to complete, whichever is first.
    pub async fn recv_ctx(&mut self, ctx: &Context) -> Result<Block> {
        tokio::select! {
            block = self.recv() => block.ok_or(CraftBlockError::Closed),
            e = ctx.done() => Err(e.into()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(bus) = self.bus.upgrade() else {
            return;
        };
        let mut state = bus.lock();
        if let Some(subs) = state.subscribers.get_mut(&self.cid) {
            subs.retain(|(id, _)| *id != self.id);
            if subs.is_empty() {
                state.subscribers.remove(&self.cid);
            }
        }
    }
}
