use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use craftblock_core::{Cid, Context, Result};
use futures::stream;
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    bounded_lookup, providers_dht_key, ContentRouting, ProviderInfo, ProviderStream,
    DEFAULT_QUERY_TIMEOUT, PROVIDER_RECORD_TTL,
};

#[derive(Debug, Clone)]
struct ProviderRecord {
    info: ProviderInfo,
    last_seen: Instant,
}

/// In-process stand-in for the provider DHT, shared by every
/// [`MemoryRouting`] attached to it.
#[derive(Debug)]
pub struct ProviderOverlay {
    records: RwLock<HashMap<Vec<u8>, HashMap<PeerId, ProviderRecord>>>,
    ttl: Duration,
    lookups: AtomicUsize,
    last_prune: Mutex<Instant>,
}

impl ProviderOverlay {
    pub fn new() -> Arc<Self> {
        Self::with_ttl(PROVIDER_RECORD_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            records: RwLock::new(HashMap::new()),
            ttl,
            lookups: AtomicUsize::new(0),
            last_prune: Mutex::new(Instant::now()),
        })
    }

    /// Record `info` under `key`. Expired records for every key are dropped
    /// at most once per TTL.
    fn add(&self, key: Vec<u8>, info: ProviderInfo) {
        let now = Instant::now();
        let mut records = self.records.write();
        let mut last_prune = self.last_prune.lock();
        if now.duration_since(*last_prune) >= self.ttl {
            *last_prune = now;
            let before = records.len();
            records.retain(|_, peers| {
                peers.retain(|_, r| now.duration_since(r.last_seen) < self.ttl);
                !peers.is_empty()
            });
            if records.len() < before {
                debug!("Pruned {} expired provider keys", before - records.len());
            }
        }
        drop(last_prune);
        records.entry(key).or_default().insert(
            info.peer,
            ProviderRecord {
                info,
                last_seen: now,
            },
        );
    }

    /// Live providers for `key`, most recently seen first. Expired records
    /// for `key` are dropped.
    fn providers(&self, key: &[u8]) -> Vec<ProviderInfo> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut records = self.records.write();
        let Some(peers) = records.get_mut(key) else {
            return Vec::new();
        };
        peers.retain(|_, r| now.duration_since(r.last_seen) < self.ttl);
        if peers.is_empty() {
            records.remove(key);
            return Vec::new();
        }
        let mut live: Vec<&ProviderRecord> = peers.values().collect();
        live.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        live.into_iter().map(|r| r.info.clone()).collect()
    }

    /// Keys with at least one stored record.
    pub fn key_count(&self) -> usize {
        self.records.read().len()
    }

    /// Total lookups served, across all attached routers.
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn provider_count(&self, cid: &Cid) -> usize {
        self.records
            .read()
            .get(&providers_dht_key(cid))
            .map(|p| p.len())
            .unwrap_or(0)
    }
}

/// [`ContentRouting`] over a shared [`ProviderOverlay`].
pub struct MemoryRouting {
    local: ProviderInfo,
    overlay: Arc<ProviderOverlay>,
    local_records: RwLock<HashSet<Vec<u8>>>,
    query_timeout: Duration,
    provides: AtomicUsize,
}

impl MemoryRouting {
    pub fn new(local: ProviderInfo, overlay: Arc<ProviderOverlay>) -> Self {
        Self {
            local,
            overlay,
            local_records: RwLock::new(HashSet::new()),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            provides: AtomicUsize::new(0),
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn local_peer(&self) -> PeerId {
        self.local.peer
    }

    /// Whether `cid` is recorded in this node's own routing table.
    pub fn is_providing(&self, cid: &Cid) -> bool {
        self.local_records.read().contains(&providers_dht_key(cid))
    }

    /// Number of successful `provide` calls.
    pub fn provide_count(&self) -> usize {
        self.provides.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ContentRouting for MemoryRouting {
    async fn provide(&self, ctx: &Context, cid: &Cid, announce: bool) -> Result<()> {
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }
        let key = providers_dht_key(cid);
        self.local_records.write().insert(key.clone());
        if announce {
            self.overlay.add(key, self.local.clone());
        }
        self.provides.fetch_add(1, Ordering::Relaxed);
        debug!("Providing {} (announce={})", cid, announce);
        Ok(())
    }

    fn find_providers_async(&self, ctx: &Context, cid: &Cid, limit: usize) -> ProviderStream {
        let found = self.overlay.providers(&providers_dht_key(cid));
        debug!("Lookup for {} found {} providers", cid, found.len());
        bounded_lookup(stream::iter(found), ctx, limit, self.query_timeout)
    }
}
