//! CraftBlock Routing
//!
//! Provider discovery: which peers can serve a block.
//!
//! DHT keys:
//! - `/craftblock/providers/<multihash_hex>`: provider records
//!
//! Keys are derived from the multihash alone so CIDv0 and CIDv1 of the same
//! content share providers.

mod memory;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use craftblock_core::{Cid, Context, Result, PROVIDERS_DHT_PREFIX};
use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};
use libp2p::{Multiaddr, PeerId};
use tokio::sync::mpsc;

pub use memory::{MemoryRouting, ProviderOverlay};

/// TTL for provider records (24 hours).
pub const PROVIDER_RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on a single provider lookup, independent of the caller's context.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);

/// A peer that claims to hold a block, with the addresses it was last seen on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl ProviderInfo {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            addrs: Vec::new(),
        }
    }
}

pub type ProviderStream = BoxStream<'static, ProviderInfo>;

/// Progress of a provider lookup, delivered to an explicit observer.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Started { key: Vec<u8> },
    Provider(ProviderInfo),
    Error(String),
    Finished { providers: usize },
}

pub type QueryObserver = mpsc::UnboundedSender<QueryEvent>;

/// Build DHT key for block providers.
pub fn providers_dht_key(cid: &Cid) -> Vec<u8> {
    format!("{}{}", PROVIDERS_DHT_PREFIX, hex::encode(cid.hash().to_bytes())).into_bytes()
}

#[async_trait]
pub trait ContentRouting: Send + Sync {
    /// Record this node as a provider of `cid`. With `announce` the record is
    /// also published to the network. Returns once the local routing table
    /// holds the record.
    async fn provide(&self, ctx: &Context, cid: &Cid, announce: bool) -> Result<()>;

    /// Lazily stream up to `limit` distinct providers (0 means no limit).
    /// The stream ends when the lookup is exhausted, its query timeout
    /// elapses or `ctx` completes.
    fn find_providers_async(&self, ctx: &Context, cid: &Cid, limit: usize) -> ProviderStream;

    /// Like [`ContentRouting::find_providers_async`], reporting progress to
    /// `observer`.
    fn find_providers_observed(
        &self,
        ctx: &Context,
        cid: &Cid,
        limit: usize,
        observer: QueryObserver,
    ) -> ProviderStream {
        let _ = observer.send(QueryEvent::Started {
            key: providers_dht_key(cid),
        });
        observe(self.find_providers_async(ctx, cid, limit), observer)
    }
}

/// Mirror every provider a stream yields to `observer`, then report the total.
pub fn observe(providers: ProviderStream, observer: QueryObserver) -> ProviderStream {
    let done = observer.clone();
    let mut count = 0usize;
    providers
        .inspect(move |p| {
            let _ = observer.send(QueryEvent::Provider(p.clone()));
        })
        .map(Some)
        .chain(futures::stream::once(async { None }))
        .filter_map(move |p| {
            match &p {
                Some(_) => count += 1,
                None => {
                    let _ = done.send(QueryEvent::Finished { providers: count });
                }
            }
            future::ready(p)
        })
        .boxed()
}

/// Bound a raw provider source: drop duplicate peers, stop after `limit`
/// results (0 = unlimited), after `timeout`, or when `ctx` completes.
pub fn bounded_lookup<S>(providers: S, ctx: &Context, limit: usize, timeout: Duration) -> ProviderStream
where
    S: Stream<Item = ProviderInfo> + Send + 'static,
{
    let ctx = ctx.clone();
    let stop = async move {
        tokio::select! {
            _ = ctx.done() => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    };
    let limit = if limit == 0 { usize::MAX } else { limit };
    let mut seen = HashSet::new();
    providers
        .take_until(stop)
        .filter(move |p| future::ready(seen.insert(p.peer)))
        .take(limit)
        .boxed()
}
