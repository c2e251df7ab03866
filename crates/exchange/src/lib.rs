//! CraftBlock Exchange
//!
//! Fetches blocks from peers on demand and serves blocks to peers that ask.
//!
//! A [`Exchange::get`] first consults the local store. On a miss it joins (or
//! starts) the single outstanding fetch for that CID: one provider lookup,
//! WANTs to at most `max_outstanding_dials` providers at a time, and a
//! one-shot notification when the block arrives. When the last interested
//! caller leaves, the fetch stops and the asked providers receive CANCEL.
//!
//! Inbound streams are read-only: every remote peer's WANT, CANCEL, HAVE and
//! BLOCK frames arrive on the stream it opened, and everything we send goes
//! out on our own per-peer stream.

mod ledger;
pub mod network;
pub mod notifications;
mod peers;
mod session;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use craftblock_core::{Block, BufferPool, Cid, Context, CraftBlockError, Result, Supervisor};
use craftblock_routing::ContentRouting;
use craftblock_store::BlockStore;
use craftblock_transfer::Message;
use futures::future;
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

pub use network::{BoxedStream, InboundStreams, MemoryNetwork, MemoryTransport, MessageStream, Network};
pub use notifications::{Notifications, Subscription};
pub use session::FetchState;

use ledger::Ledger;
use peers::PeerQueue;
use session::PendingEntry;

/// Tuning knobs for an [`Exchange`].
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Providers requested per lookup (0 = no limit).
    pub provider_query_limit: usize,
    /// Providers dialed concurrently per fetch.
    pub max_outstanding_dials: usize,
    /// Repeat the provider lookup this often while a fetch is unresolved.
    pub rebroadcast_interval: Option<Duration>,
    /// Consecutive undecodable frames tolerated before disconnecting a peer.
    pub max_malformed_frames: usize,
    /// Announce blocks handed to `has_block` (and fetched blocks) in the
    /// background.
    pub provide_on_has_block: bool,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            provider_query_limit: 10,
            max_outstanding_dials: 6,
            rebroadcast_interval: Some(Duration::from_secs(30)),
            max_malformed_frames: 3,
            provide_on_has_block: true,
        }
    }
}

/// Offered every inbound WANT. Used to spot hot keys.
pub trait WantObserver: Send + Sync {
    fn on_want(&self, peer: &PeerId, cid: &Cid);
}

/// Point-in-time copy of the exchange counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStats {
    pub wants_sent: u64,
    pub cancels_sent: u64,
    pub blocks_sent: u64,
    pub wants_received: u64,
    pub blocks_received: u64,
    pub hash_mismatches: u64,
    pub unwanted_blocks: u64,
    /// Received blocks dropped because the local store rejected the write.
    pub store_failures: u64,
    pub malformed_frames: u64,
    pub provider_lookups: u64,
}

#[derive(Debug, Default)]
struct Counters {
    wants_sent: AtomicU64,
    cancels_sent: AtomicU64,
    blocks_sent: AtomicU64,
    wants_received: AtomicU64,
    blocks_received: AtomicU64,
    hash_mismatches: AtomicU64,
    unwanted_blocks: AtomicU64,
    store_failures: AtomicU64,
    malformed_frames: AtomicU64,
    provider_lookups: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    fn record_sent(&self, msg: &Message) {
        match msg {
            Message::Want(_) => bump(&self.wants_sent),
            Message::Cancel(_) => bump(&self.cancels_sent),
            Message::Block { .. } => bump(&self.blocks_sent),
            Message::Have(_) => {}
        }
    }

    fn snapshot(&self) -> ExchangeStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ExchangeStats {
            wants_sent: load(&self.wants_sent),
            cancels_sent: load(&self.cancels_sent),
            blocks_sent: load(&self.blocks_sent),
            wants_received: load(&self.wants_received),
            blocks_received: load(&self.blocks_received),
            hash_mismatches: load(&self.hash_mismatches),
            unwanted_blocks: load(&self.unwanted_blocks),
            store_failures: load(&self.store_failures),
            malformed_frames: load(&self.malformed_frames),
            provider_lookups: load(&self.provider_lookups),
        }
    }
}

pub(crate) struct Inner {
    config: ExchangeConfig,
    local: PeerId,
    store: Arc<dyn BlockStore>,
    routing: Arc<dyn ContentRouting>,
    network: Arc<dyn Network>,
    notifications: Notifications,
    pending: Mutex<HashMap<Cid, PendingEntry>>,
    ledger: Ledger,
    queues: Mutex<HashMap<PeerId, PeerQueue>>,
    observer: RwLock<Option<Arc<dyn WantObserver>>>,
    pool: BufferPool,
    counters: Counters,
    next_id: AtomicU64,
    supervisor: Supervisor,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn lookup_local(&self, cid: &Cid) -> Result<Option<Block>> {
        match self.store.get(cid) {
            Ok(block) => Ok(Some(block)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Everything that follows a block landing in the store: wake waiters,
    /// settle the pending fetch, serve peers that asked for it and optionally
    /// announce it.
    fn accept_block(self: &Arc<Self>, block: &Block, from: Option<PeerId>) {
        let woken = self.notifications.publish(block);
        self.resolve(block.cid(), from);
        for peer in self.ledger.take_wanting(block.cid()) {
            self.send(peer, Message::from(block.clone()));
        }
        if woken > 0 {
            debug!("Delivered {} to {} waiters", block.cid(), woken);
        }
        if self.config.provide_on_has_block && !craftblock_core::content_id::is_identity(block.cid()) {
            let routing = self.routing.clone();
            let cid = *block.cid();
            self.supervisor.spawn_with("exchange-provide", move |ctx| async move {
                if let Err(e) = routing.provide(&ctx, &cid, true).await {
                    debug!("Background provide of {} failed: {}", cid, e);
                }
            });
        }
    }
}

/// Handle to a running block exchange. Cheap to clone.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

impl Exchange {
    /// Start an exchange serving `inbound` streams. Must be called inside a
    /// Tokio runtime.
    pub fn new(
        config: ExchangeConfig,
        store: Arc<dyn BlockStore>,
        routing: Arc<dyn ContentRouting>,
        network: Arc<dyn Network>,
        inbound: InboundStreams,
    ) -> Self {
        let inner = Arc::new(Inner {
            config,
            local: network.local_peer(),
            store,
            routing,
            network,
            notifications: Notifications::new(),
            pending: Mutex::new(HashMap::new()),
            ledger: Ledger::default(),
            queues: Mutex::new(HashMap::new()),
            observer: RwLock::new(None),
            pool: BufferPool::new(),
            counters: Counters::default(),
            next_id: AtomicU64::new(0),
            supervisor: Supervisor::new(),
        });
        let acceptor = inner.clone();
        inner
            .supervisor
            .spawn_with("exchange-accept", move |ctx| acceptor.accept_streams(inbound, ctx));
        info!("Exchange started for {}", inner.local);
        Self { inner }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn set_want_observer(&self, observer: Arc<dyn WantObserver>) {
        *self.inner.observer.write() = Some(observer);
    }

    /// The block for `cid`, from the local store or the network.
    ///
    /// `ctx` is the only deadline: the call waits until the block arrives or
    /// `ctx` completes.
    pub async fn get(&self, ctx: &Context, cid: &Cid) -> Result<Block> {
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }
        if let Some(block) = self.inner.lookup_local(cid)? {
            return Ok(block);
        }
        if self.inner.supervisor.is_closing() {
            return Err(CraftBlockError::Closed);
        }
        let mut subscription = self.inner.notifications.subscribe(*cid);
        // The block may have landed between the first lookup and subscribing.
        if let Some(block) = self.inner.lookup_local(cid)? {
            return Ok(block);
        }
        let _interest = self.inner.attach(*cid);
        subscription.recv_ctx(ctx).await
    }

    /// Fetch several blocks concurrently. Blocks are yielded in arrival
    /// order; CIDs that fail or time out are simply absent. Duplicate CIDs
    /// are fetched once.
    pub fn get_many(&self, ctx: &Context, cids: &[Cid]) -> BoxStream<'static, Block> {
        let mut seen = HashSet::new();
        let fetches: FuturesUnordered<_> = cids
            .iter()
            .filter(|cid| seen.insert(**cid))
            .map(|cid| {
                let exchange = self.clone();
                let ctx = ctx.clone();
                let cid = *cid;
                async move {
                    let result = exchange.get(&ctx, &cid).await;
                    if let Err(e) = &result {
                        if !e.is_context() {
                            debug!("get_many: {} failed: {}", cid, e);
                        }
                    }
                    result
                }
            })
            .collect();
        fetches.filter_map(|r| future::ready(r.ok())).boxed()
    }

    /// Add a locally produced block: store it, wake anyone waiting, serve
    /// peers that want it and cancel any outstanding fetch for it.
    pub fn has_block(&self, block: Block) -> Result<()> {
        self.inner.store.put(&block)?;
        self.inner.accept_block(&block, None);
        Ok(())
    }

    pub fn is_pending(&self, cid: &Cid) -> bool {
        self.inner.pending.lock().contains_key(cid)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn fetch_state(&self, cid: &Cid) -> Option<FetchState> {
        self.inner.pending.lock().get(cid).map(|e| e.state)
    }

    /// CIDs this node is currently fetching.
    pub fn wantlist(&self) -> Vec<Cid> {
        self.inner.pending.lock().keys().copied().collect()
    }

    /// CIDs `peer` has asked us for and we do not have yet.
    pub fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Cid> {
        self.inner.ledger.wantlist(peer)
    }

    pub fn wanting_peer_count(&self) -> usize {
        self.inner.ledger.peer_count()
    }

    pub fn subscriber_count(&self, cid: &Cid) -> usize {
        self.inner.notifications.subscriber_count(cid)
    }

    pub fn stats(&self) -> ExchangeStats {
        self.inner.counters.snapshot()
    }

    /// Stop all exchange tasks. Outstanding `get` calls fail with
    /// [`CraftBlockError::Closed`].
    pub async fn close(&self) {
        self.inner.notifications.shutdown();
        self.inner.supervisor.close().await;
        self.inner.pending.lock().clear();
        self.inner.queues.lock().clear();
        info!("Exchange for {} closed", self.inner.local);
    }
}
