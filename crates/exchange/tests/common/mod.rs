//! Shared harness: exchange nodes wired over an in-memory network and
//! provider overlay, plus a scripted raw peer that speaks frames directly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use craftblock_core::{Block, BufferPool, Cid, Context};
use craftblock_exchange::{BoxedStream, Exchange, ExchangeConfig, InboundStreams, MemoryNetwork, MemoryTransport, Network};
use craftblock_routing::{ContentRouting, MemoryRouting, ProviderInfo, ProviderOverlay};
use craftblock_store::{BlockStore, MemoryStore};
use craftblock_transfer::{decode_body, read_frame, write_message, Message};
use libp2p::PeerId;

pub struct Node {
    pub peer: PeerId,
    pub exchange: Exchange,
    pub store: Arc<MemoryStore>,
    pub routing: Arc<MemoryRouting>,
}

pub struct Swarm {
    pub net: MemoryNetwork,
    pub overlay: Arc<ProviderOverlay>,
}

impl Swarm {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            net: MemoryNetwork::new(),
            overlay: ProviderOverlay::new(),
        }
    }

    pub fn node(&self) -> Node {
        self.node_with(ExchangeConfig::default())
    }

    pub fn node_with(&self, config: ExchangeConfig) -> Node {
        self.node_over(config, |store| store as Arc<dyn BlockStore>)
    }

    /// Node whose exchange sees `layer(store)` instead of the bare memory store.
    pub fn node_over<F>(&self, config: ExchangeConfig, layer: F) -> Node
    where
        F: FnOnce(Arc<MemoryStore>) -> Arc<dyn BlockStore>,
    {
        let peer = PeerId::random();
        let (transport, inbound) = self.net.join(peer);
        let store = Arc::new(MemoryStore::new());
        let routing = Arc::new(MemoryRouting::new(ProviderInfo::new(peer), self.overlay.clone()));
        let exchange = Exchange::new(
            config,
            layer(store.clone()),
            routing.clone() as Arc<dyn ContentRouting>,
            transport as Arc<dyn Network>,
            inbound,
        );
        Node {
            peer,
            exchange,
            store,
            routing,
        }
    }

    pub fn raw_peer(&self) -> RawPeer {
        let peer = PeerId::random();
        let (transport, inbound) = self.net.join(peer);
        let routing = MemoryRouting::new(ProviderInfo::new(peer), self.overlay.clone());
        RawPeer {
            peer,
            transport,
            inbound,
            routing,
            outbound: None,
            pool: BufferPool::new(),
        }
    }
}

/// A peer without an exchange. Tests drive its frames by hand.
pub struct RawPeer {
    pub peer: PeerId,
    pub transport: Arc<MemoryTransport>,
    pub inbound: InboundStreams,
    pub routing: MemoryRouting,
    outbound: Option<BoxedStream>,
    pool: BufferPool,
}

impl RawPeer {
    /// Announce `cid` without holding it.
    pub async fn announce(&self, cid: &Cid) {
        self.routing.provide(&Context::background(), cid, true).await.unwrap();
    }

    /// Wait for the next stream a node opens to us.
    pub async fn accept(&mut self) -> (PeerId, BoxedStream) {
        tokio::time::timeout(Duration::from_secs(5), self.inbound.recv())
            .await
            .expect("no inbound stream")
            .expect("network closed")
    }

    pub async fn next_message(&self, stream: &mut BoxedStream) -> Message {
        let body = tokio::time::timeout(Duration::from_secs(5), read_frame(stream, &self.pool))
            .await
            .expect("no frame")
            .unwrap()
            .expect("stream closed");
        decode_body(&body).unwrap()
    }

    pub async fn send(&mut self, to: PeerId, msg: &Message) {
        if self.outbound.is_none() {
            self.outbound = Some(self.transport.open_stream(to).await.unwrap());
        }
        let out = self.outbound.as_mut().unwrap();
        write_message(out, msg).await.unwrap();
    }

    pub async fn send_raw(&mut self, to: PeerId, bytes: &[u8]) {
        use futures::AsyncWriteExt;
        if self.outbound.is_none() {
            self.outbound = Some(self.transport.open_stream(to).await.unwrap());
        }
        let out = self.outbound.as_mut().unwrap();
        out.write_all(bytes).await.unwrap();
        out.flush().await.unwrap();
    }
}

pub fn block(label: &str) -> Block {
    Block::new(label.as_bytes().to_vec())
}

pub fn ctx_secs(secs: u64) -> Context {
    Context::background().with_timeout(Duration::from_secs(secs))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
