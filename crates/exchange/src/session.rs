//! Pending fetches: at most one per CID, shared by every interested caller.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use craftblock_core::{Cid, Context};
use craftblock_routing::ProviderInfo;
use craftblock_transfer::Message;
use futures::future;
use futures::StreamExt;
use libp2p::PeerId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::Inner;

/// Progress of a pending fetch. Resolved and cancelled fetches are removed
/// from the pending map, so only live states are observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    Idle,
    Soliciting,
    Dialing,
    Waiting,
}

pub(crate) struct PendingEntry {
    generation: u64,
    refs: usize,
    pub(crate) state: FetchState,
    cancel: CancellationToken,
    asked: HashSet<PeerId>,
}

/// Keeps a pending fetch alive. Dropping the last one cancels it.
pub(crate) struct Interest {
    inner: Arc<Inner>,
    cid: Cid,
    generation: u64,
}

impl Drop for Interest {
    fn drop(&mut self) {
        self.inner.release(&self.cid, self.generation);
    }
}

impl Inner {
    /// Join the pending fetch for `cid`, starting it if there is none.
    pub(crate) fn attach(self: &Arc<Self>, cid: Cid) -> Interest {
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(&cid) {
            entry.refs += 1;
            return Interest {
                inner: self.clone(),
                cid,
                generation: entry.generation,
            };
        }
        let generation = self.next_id();
        let cancel = self.supervisor.closing_token().child_token();
        pending.insert(
            cid,
            PendingEntry {
                generation,
                refs: 1,
                state: FetchState::Idle,
                cancel: cancel.clone(),
                asked: HashSet::new(),
            },
        );
        drop(pending);

        let fetcher = self.clone();
        self.supervisor.spawn("exchange-fetch", async move {
            fetcher.run_fetch(cid, generation, Context::from_token(cancel)).await;
        });
        Interest {
            inner: self.clone(),
            cid,
            generation,
        }
    }

    fn release(self: &Arc<Self>, cid: &Cid, generation: u64) {
        let removed = {
            let mut pending = self.pending.lock();
            let last = match pending.get_mut(cid) {
                Some(entry) if entry.generation == generation => {
                    entry.refs -= 1;
                    entry.refs == 0
                }
                _ => false,
            };
            if last {
                pending.remove(cid)
            } else {
                None
            }
        };
        if let Some(entry) = removed {
            debug!("Fetch for {} cancelled, last waiter left", cid);
            entry.cancel.cancel();
            for peer in entry.asked {
                self.send(peer, Message::Cancel(*cid));
            }
        }
    }

    /// Settle the pending fetch for `cid` once the block is stored. Asked
    /// peers other than `from` are told to stop looking.
    pub(crate) fn resolve(self: &Arc<Self>, cid: &Cid, from: Option<PeerId>) {
        let removed = self.pending.lock().remove(cid);
        if let Some(entry) = removed {
            entry.cancel.cancel();
            for peer in entry.asked {
                if Some(peer) != from {
                    self.send(peer, Message::Cancel(*cid));
                }
            }
        }
    }

    pub(crate) fn is_wanted(&self, cid: &Cid) -> bool {
        self.pending.lock().contains_key(cid)
    }

    fn set_state(&self, cid: &Cid, generation: u64, state: FetchState) {
        if let Some(entry) = self.pending.lock().get_mut(cid) {
            if entry.generation == generation {
                entry.state = state;
            }
        }
    }

    /// Record that `peer` is being asked for `cid`. False if it already was,
    /// or the fetch is gone.
    fn mark_asked(&self, cid: &Cid, generation: Option<u64>, peer: PeerId) -> bool {
        match self.pending.lock().get_mut(cid) {
            Some(entry) if generation.map_or(true, |g| g == entry.generation) => {
                entry.asked.insert(peer)
            }
            _ => false,
        }
    }

    /// A peer announced it holds `cid`; ask it if we are fetching `cid`.
    pub(crate) fn on_have(self: &Arc<Self>, peer: PeerId, cid: Cid) {
        if self.mark_asked(&cid, None, peer) {
            debug!("{} has pending {}, sending WANT", peer, cid);
            self.send(peer, Message::Want(cid));
        }
    }

    async fn run_fetch(self: Arc<Self>, cid: Cid, generation: u64, ctx: Context) {
        loop {
            if ctx.is_done() {
                return;
            }
            self.set_state(&cid, generation, FetchState::Soliciting);
            self.counters.provider_lookups.fetch_add(1, Ordering::Relaxed);
            debug!("Looking up providers for {}", cid);

            let local = self.local;
            let providers = self
                .routing
                .find_providers_async(&ctx, &cid, self.config.provider_query_limit)
                .filter(move |p| future::ready(p.peer != local));
            providers
                .for_each_concurrent(self.config.max_outstanding_dials.max(1), |provider| {
                    self.solicit(&ctx, cid, generation, provider)
                })
                .await;

            if ctx.is_done() {
                return;
            }
            self.set_state(&cid, generation, FetchState::Waiting);
            match self.config.rebroadcast_interval {
                Some(interval) => {
                    tokio::select! {
                        _ = ctx.done() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                None => {
                    ctx.done().await;
                    return;
                }
            }
        }
    }

    async fn solicit(self: &Arc<Self>, ctx: &Context, cid: Cid, generation: u64, provider: ProviderInfo) {
        self.set_state(&cid, generation, FetchState::Dialing);
        let connected = tokio::select! {
            r = self.network.connect(&provider) => r,
            _ = ctx.done() => return,
        };
        if let Err(e) = connected {
            debug!("Provider {} for {} unreachable: {}", provider.peer, cid, e);
            return;
        }
        if self.mark_asked(&cid, Some(generation), provider.peer) {
            self.send(provider.peer, Message::Want(cid));
            self.set_state(&cid, generation, FetchState::Waiting);
        }
    }
}
