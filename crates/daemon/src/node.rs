//! libp2p side of the node: the swarm event loop and the routing and
//! network handles the exchange talks to.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use craftblock_core::{Cid, Context, CraftBlockError, Result, Supervisor, EXCHANGE_PROTOCOL};
use craftblock_exchange::{BoxedStream, InboundStreams, Network};
use craftblock_routing::{bounded_lookup, providers_dht_key, ContentRouting, ProviderInfo, ProviderStream, DEFAULT_QUERY_TIMEOUT};
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use libp2p::kad::store::RecordStore;
use libp2p::kad::{self, GetProvidersOk, ProviderRecord, QueryId, QueryResult, RecordKey};
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{identify, PeerId, StreamProtocol};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::behaviour::{CraftBlockBehaviourEvent, CraftBlockSwarm};
use crate::commands::NodeCommand;
use crate::events::{DaemonEvent, EventSender};

pub type CommandSender = mpsc::UnboundedSender<NodeCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<NodeCommand>;

/// Inbound exchange streams buffered before the exchange picks them up.
const INBOUND_BACKLOG: usize = 64;

/// Owns the swarm and serves [`NodeCommand`]s until the context completes.
pub struct SwarmDriver {
    swarm: CraftBlockSwarm,
    events: EventSender,
    provider_queries: HashMap<QueryId, fmpsc::UnboundedSender<ProviderInfo>>,
    pending_dials: HashMap<PeerId, Vec<oneshot::Sender<std::result::Result<(), String>>>>,
}

impl SwarmDriver {
    pub fn new(swarm: CraftBlockSwarm, events: EventSender) -> Self {
        Self {
            swarm,
            events,
            provider_queries: HashMap::new(),
            pending_dials: HashMap::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        *self.swarm.local_peer_id()
    }

    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.swarm.behaviour().stream.new_control()
    }

    pub async fn run(mut self, mut commands: CommandReceiver, ctx: Context) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = ctx.done() => break,
            }
        }
        info!("Swarm event loop ended");
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<CraftBlockBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                let _ = self.events.send(DaemonEvent::ListeningOn {
                    address: address.to_string(),
                });
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, num_established, ..
            } => {
                if let Some(waiters) = self.pending_dials.remove(&peer_id) {
                    for tx in waiters {
                        let _ = tx.send(Ok(()));
                    }
                }
                if num_established.get() == 1 {
                    info!("Connected to {} ({} peers total)", peer_id, self.swarm.connected_peers().count());
                    let _ = self.events.send(DaemonEvent::PeerConnected {
                        peer_id: peer_id.to_string(),
                    });
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id, num_established, ..
            } => {
                if num_established == 0 {
                    info!("Disconnected from {}", peer_id);
                    let _ = self.events.send(DaemonEvent::PeerDisconnected {
                        peer_id: peer_id.to_string(),
                    });
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                debug!("Dial to {} failed: {}", peer, error);
                if !self.swarm.is_connected(&peer) {
                    if let Some(waiters) = self.pending_dials.remove(&peer) {
                        for tx in waiters {
                            let _ = tx.send(Err(error.to_string()));
                        }
                    }
                }
            }
            SwarmEvent::Behaviour(CraftBlockBehaviourEvent::Kademlia(event)) => self.handle_kad_event(event),
            SwarmEvent::Behaviour(CraftBlockBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                for addr in info.listen_addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                }
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        let kad::Event::OutboundQueryProgressed { id, result, step, .. } = event else {
            return;
        };
        match result {
            QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders { providers, .. })) => {
                let mut closed = false;
                if let Some(tx) = self.provider_queries.get(&id) {
                    // Kademlia supplies the addresses when the exchange dials by peer id.
                    for peer in providers {
                        if tx.unbounded_send(ProviderInfo::new(peer)).is_err() {
                            closed = true;
                            break;
                        }
                    }
                }
                if closed {
                    debug!("Provider lookup {:?} abandoned by caller", id);
                    self.provider_queries.remove(&id);
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                }
            }
            QueryResult::GetProviders(Ok(GetProvidersOk::FinishedWithNoAdditionalRecord { .. })) => {
                self.provider_queries.remove(&id);
            }
            QueryResult::GetProviders(Err(e)) => {
                debug!("Provider lookup failed: {:?}", e);
                self.provider_queries.remove(&id);
            }
            QueryResult::StartProviding(Err(e)) => {
                debug!("Provider record publish failed: {:?}", e);
            }
            QueryResult::Bootstrap(Ok(ok)) => {
                debug!("Kademlia bootstrap step, {} peers remaining", ok.num_remaining);
            }
            _ => {}
        }
        if step.last {
            self.provider_queries.remove(&id);
        }
    }

    fn handle_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::StartProviding { key, announce, reply_tx } => {
                let result = if announce {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .start_providing(key)
                        .map(|_| ())
                        .map_err(|e| format!("Failed to add provider record: {:?}", e))
                } else {
                    let local = self.local_peer();
                    let addrs = self.swarm.external_addresses().cloned().collect();
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .store_mut()
                        .add_provider(ProviderRecord::new(key, local, addrs))
                        .map_err(|e| format!("Failed to add provider record: {:?}", e))
                };
                let _ = reply_tx.send(result);
            }
            NodeCommand::GetProviders { key, providers_tx } => {
                let id = self.swarm.behaviour_mut().kademlia.get_providers(key);
                self.provider_queries.insert(id, providers_tx);
            }
            NodeCommand::Dial { peer, addrs, reply_tx } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply_tx.send(Ok(()));
                    return;
                }
                if let Some(waiters) = self.pending_dials.get_mut(&peer) {
                    waiters.push(reply_tx);
                    return;
                }
                for addr in &addrs {
                    self.swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
                }
                let opts = DialOpts::peer_id(peer).addresses(addrs).build();
                match self.swarm.dial(opts) {
                    Ok(()) => {
                        self.pending_dials.insert(peer, vec![reply_tx]);
                    }
                    Err(e) => {
                        let _ = reply_tx.send(Err(e.to_string()));
                    }
                }
            }
            NodeCommand::Disconnect { peer } => {
                if self.swarm.disconnect_peer_id(peer).is_ok() {
                    info!("Disconnected misbehaving peer {}", peer);
                }
            }
        }
    }
}

/// [`ContentRouting`] over Kademlia provider records.
pub struct KadRouting {
    commands: CommandSender,
    query_timeout: Duration,
}

impl KadRouting {
    pub fn new(commands: CommandSender) -> Self {
        Self {
            commands,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }
}

#[async_trait]
impl ContentRouting for KadRouting {
    async fn provide(&self, ctx: &Context, cid: &Cid, announce: bool) -> Result<()> {
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::StartProviding {
                key: RecordKey::new(&providers_dht_key(cid)),
                announce,
                reply_tx,
            })
            .map_err(|_| CraftBlockError::Closed)?;
        tokio::select! {
            reply = reply_rx => reply
                .map_err(|_| CraftBlockError::Closed)?
                .map_err(CraftBlockError::Network),
            e = ctx.done() => Err(e.into()),
        }
    }

    fn find_providers_async(&self, ctx: &Context, cid: &Cid, limit: usize) -> ProviderStream {
        let (providers_tx, providers_rx) = fmpsc::unbounded();
        let sent = self.commands.send(NodeCommand::GetProviders {
            key: RecordKey::new(&providers_dht_key(cid)),
            providers_tx,
        });
        if sent.is_err() {
            return futures::stream::empty().boxed();
        }
        bounded_lookup(providers_rx, ctx, limit, self.query_timeout)
    }
}

/// [`Network`] over libp2p connections and `libp2p_stream`.
pub struct NodeNetwork {
    local: PeerId,
    control: libp2p_stream::Control,
    commands: CommandSender,
}

impl NodeNetwork {
    pub fn new(local: PeerId, control: libp2p_stream::Control, commands: CommandSender) -> Self {
        Self {
            local,
            control,
            commands,
        }
    }
}

#[async_trait]
impl Network for NodeNetwork {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn connect(&self, provider: &ProviderInfo) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(NodeCommand::Dial {
                peer: provider.peer,
                addrs: provider.addrs.clone(),
                reply_tx,
            })
            .map_err(|_| CraftBlockError::Closed)?;
        reply_rx
            .await
            .map_err(|_| CraftBlockError::Closed)?
            .map_err(CraftBlockError::Network)
    }

    async fn open_stream(&self, peer: PeerId) -> Result<BoxedStream> {
        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, StreamProtocol::new(EXCHANGE_PROTOCOL))
            .await
            .map_err(|e| CraftBlockError::Network(format!("Failed to open stream to {}: {}", peer, e)))?;
        Ok(Box::new(stream))
    }

    fn disconnect(&self, peer: &PeerId) {
        let _ = self.commands.send(NodeCommand::Disconnect { peer: *peer });
    }
}

/// Register the exchange protocol and forward accepted streams into a
/// channel the exchange consumes. The forwarder runs under `supervisor`.
pub fn accept_exchange_streams(control: &mut libp2p_stream::Control, supervisor: &Supervisor) -> Result<InboundStreams> {
    let mut incoming = control
        .accept(StreamProtocol::new(EXCHANGE_PROTOCOL))
        .map_err(|e| CraftBlockError::Network(format!("Failed to register {}: {}", EXCHANGE_PROTOCOL, e)))?;
    let (tx, rx) = mpsc::channel(INBOUND_BACKLOG);
    supervisor.spawn_with("exchange-acceptor", move |ctx| async move {
        loop {
            let next = tokio::select! {
                next = incoming.next() => next,
                _ = ctx.done() => break,
            };
            let Some((peer, stream)) = next else {
                break;
            };
            debug!("Received exchange stream from {}", peer);
            let stream: BoxedStream = Box::new(stream);
            if tx.send((peer, stream)).await.is_err() {
                break;
            }
        }
        debug!("Exchange stream acceptor stopped");
    });
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use craftblock_core::Block;

    #[tokio::test]
    async fn test_kad_routing_provide_round_trip_through_commands() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let routing = KadRouting::new(tx);
        let cid = *Block::new(&b"announce me"[..]).cid();

        let serve = tokio::spawn(async move {
            match rx.recv().await {
                Some(NodeCommand::StartProviding { key, announce, reply_tx }) => {
                    assert!(announce);
                    assert_eq!(key.to_vec(), providers_dht_key(&cid));
                    reply_tx.send(Ok(())).unwrap();
                }
                other => panic!("unexpected command {:?}", other),
            }
        });
        routing.provide(&Context::background(), &cid, true).await.unwrap();
        serve.await.unwrap();
    }

    #[tokio::test]
    async fn test_kad_routing_streams_distinct_providers() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let routing = KadRouting::new(tx);
        let cid = *Block::new(&b"find me"[..]).cid();
        let a = PeerId::random();
        let b = PeerId::random();

        let providers = routing.find_providers_async(&Context::background(), &cid, 0);
        let Some(NodeCommand::GetProviders { providers_tx, .. }) = rx.recv().await else {
            panic!("expected a provider lookup");
        };
        for peer in [a, a, b] {
            providers_tx.unbounded_send(ProviderInfo::new(peer)).unwrap();
        }
        drop(providers_tx);

        let found: Vec<PeerId> = providers.map(|p| p.peer).collect().await;
        assert_eq!(found, vec![a, b]);
    }

    #[tokio::test]
    async fn test_closed_node_reports_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let routing = KadRouting::new(tx);
        let cid = *Block::new(&b"gone"[..]).cid();
        let err = routing.provide(&Context::background(), &cid, true).await.unwrap_err();
        assert!(matches!(err, CraftBlockError::Closed));
        let found: Vec<_> = routing.find_providers_async(&Context::background(), &cid, 5).collect().await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_acceptor_runs_under_supervisor() {
        let (events, _) = crate::events::event_channel(8);
        let swarm = crate::behaviour::build_swarm(
            libp2p::identity::Keypair::generate_ed25519(),
            0,
            &[],
            Duration::from_secs(5),
        )
        .unwrap();
        let driver = SwarmDriver::new(swarm, events);
        let mut control = driver.stream_control();
        let supervisor = Supervisor::new();

        let _inbound = accept_exchange_streams(&mut control, &supervisor).unwrap();
        assert_eq!(supervisor.task_count(), 1);
        assert!(accept_exchange_streams(&mut control, &supervisor).is_err());

        supervisor.close().await;
        assert_eq!(supervisor.task_count(), 0);
    }
}
