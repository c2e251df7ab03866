//! Transport seam between the exchange and the peer-to-peer stack.
//!
//! The exchange only needs to dial providers, open one outbound message
//! stream per peer and receive the streams peers open towards it.
//! [`MemoryNetwork`] provides all three in-process over `tokio::io::duplex`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use craftblock_core::{CraftBlockError, Result};
use craftblock_routing::ProviderInfo;
use futures::io::{AsyncRead, AsyncWrite};
use libp2p::PeerId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::debug;

/// A bidirectional byte stream carrying exchange frames.
pub trait MessageStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> MessageStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn MessageStream>;

/// Streams opened towards us, tagged with the remote peer.
pub type InboundStreams = mpsc::Receiver<(PeerId, BoxedStream)>;

#[async_trait]
pub trait Network: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Make sure the provider is reachable, dialing it if needed.
    async fn connect(&self, provider: &ProviderInfo) -> Result<()>;

    /// Open an outbound exchange stream to `peer`.
    async fn open_stream(&self, peer: PeerId) -> Result<BoxedStream>;

    /// Drop the connection to a misbehaving peer.
    fn disconnect(&self, peer: &PeerId);
}

/// In-memory stream buffer per direction.
const DUPLEX_BUFFER: usize = 256 * 1024;

/// Backlog of inbound streams per peer.
const INBOUND_BACKLOG: usize = 64;

#[derive(Default)]
struct Hub {
    peers: Mutex<HashMap<PeerId, mpsc::Sender<(PeerId, BoxedStream)>>>,
    streams_opened: AtomicUsize,
    disconnects: AtomicUsize,
}

/// A set of in-process peers that can open streams to each other.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `peer`; returns its transport and the streams it will accept.
    pub fn join(&self, peer: PeerId) -> (Arc<MemoryTransport>, InboundStreams) {
        let (tx, rx) = mpsc::channel(INBOUND_BACKLOG);
        self.hub.peers.lock().insert(peer, tx);
        let transport = Arc::new(MemoryTransport {
            local: peer,
            hub: self.hub.clone(),
        });
        (transport, rx)
    }

    /// Detach `peer`; streams it accepted stay open until dropped.
    pub fn leave(&self, peer: &PeerId) {
        self.hub.peers.lock().remove(peer);
    }

    pub fn streams_opened(&self) -> usize {
        self.hub.streams_opened.load(Ordering::Relaxed)
    }

    pub fn disconnects(&self) -> usize {
        self.hub.disconnects.load(Ordering::Relaxed)
    }
}

pub struct MemoryTransport {
    local: PeerId,
    hub: Arc<Hub>,
}

impl MemoryTransport {
    fn acceptor(&self, peer: &PeerId) -> Result<mpsc::Sender<(PeerId, BoxedStream)>> {
        self.hub
            .peers
            .lock()
            .get(peer)
            .cloned()
            .ok_or_else(|| CraftBlockError::Network(format!("peer {} unreachable", peer)))
    }
}

#[async_trait]
impl Network for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn connect(&self, provider: &ProviderInfo) -> Result<()> {
        self.acceptor(&provider.peer).map(|_| ())
    }

    async fn open_stream(&self, peer: PeerId) -> Result<BoxedStream> {
        let acceptor = self.acceptor(&peer)?;
        let (local_end, remote_end) = tokio::io::duplex(DUPLEX_BUFFER);
        let remote: BoxedStream = Box::new(remote_end.compat());
        acceptor
            .send((self.local, remote))
            .await
            .map_err(|_| CraftBlockError::Network(format!("peer {} stopped accepting", peer)))?;
        self.hub.streams_opened.fetch_add(1, Ordering::Relaxed);
        debug!("Opened in-memory stream {} -> {}", self.local, peer);
        Ok(Box::new(local_end.compat()))
    }

    fn disconnect(&self, peer: &PeerId) {
        self.hub.disconnects.fetch_add(1, Ordering::Relaxed);
        debug!("Disconnect requested {} -> {}", self.local, peer);
    }
}
