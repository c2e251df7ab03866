//! Daemon command system
//!
//! Commands sent from routing and network handles to the swarm event loop.

use craftblock_routing::ProviderInfo;
use futures::channel::mpsc;
use libp2p::kad::RecordKey;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::oneshot;

/// Commands that can be sent to the swarm event loop.
#[derive(Debug)]
pub enum NodeCommand {
    /// Add a provider record for `key`, publishing it when `announce` is set.
    /// Replies once the local record store holds it.
    StartProviding {
        key: RecordKey,
        announce: bool,
        reply_tx: oneshot::Sender<Result<(), String>>,
    },
    /// Look up providers, streaming each as it is found. The stream ends
    /// when the query finishes or the receiver is dropped.
    GetProviders {
        key: RecordKey,
        providers_tx: mpsc::UnboundedSender<ProviderInfo>,
    },
    /// Make sure a connection to `peer` exists.
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply_tx: oneshot::Sender<Result<(), String>>,
    },
    /// Close all connections to `peer`.
    Disconnect { peer: PeerId },
}
