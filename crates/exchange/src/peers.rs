//! Per-peer message plumbing.
//!
//! Outbound: one queue task per peer owns our stream to that peer and writes
//! frames in order. Inbound: one reader task per accepted stream decodes
//! frames and dispatches them.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use craftblock_core::{Block, Cid, Context, CraftBlockError};
use craftblock_transfer::{decode_body, read_frame, write_message, Message, TransferError};
use libp2p::PeerId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::network::{BoxedStream, InboundStreams};
use crate::Inner;

pub(crate) struct PeerQueue {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
}

impl Inner {
    /// Queue `msg` for `peer`, starting its queue task if needed.
    pub(crate) fn send(self: &Arc<Self>, peer: PeerId, msg: Message) {
        if self.supervisor.is_closing() {
            return;
        }
        let mut queues = self.queues.lock();
        let msg = match queues.get(&peer) {
            Some(queue) => match queue.tx.send(msg) {
                Ok(()) => return,
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id();
        let _ = tx.send(msg);
        queues.insert(peer, PeerQueue { id, tx });
        drop(queues);

        let writer = self.clone();
        self.supervisor.spawn_with("exchange-peer-queue", move |ctx| async move {
            writer.run_peer_queue(peer, id, rx, ctx).await;
        });
    }

    async fn run_peer_queue(
        self: Arc<Self>,
        peer: PeerId,
        id: u64,
        mut rx: mpsc::UnboundedReceiver<Message>,
        ctx: Context,
    ) {
        let mut stream: Option<BoxedStream> = None;
        loop {
            let msg = tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
                _ = ctx.done() => break,
            };
            if stream.is_none() {
                match self.network.open_stream(peer).await {
                    Ok(s) => stream = Some(s),
                    Err(e) => {
                        warn!("Failed to open exchange stream to {}: {}", peer, e);
                        break;
                    }
                }
            }
            let Some(out) = stream.as_mut() else {
                break;
            };
            match write_message(out, &msg).await {
                Ok(()) => self.counters.record_sent(&msg),
                Err(e) => {
                    let category = TransferError::from_io(&e);
                    warn!(
                        "Dropping queue to {} after {} error sending {}: {}",
                        peer,
                        category.error_type(),
                        msg.kind(),
                        e
                    );
                    break;
                }
            }
        }
        let mut queues = self.queues.lock();
        if queues.get(&peer).map(|q| q.id) == Some(id) {
            queues.remove(&peer);
        }
    }

    pub(crate) async fn accept_streams(self: Arc<Self>, mut inbound: InboundStreams, ctx: Context) {
        loop {
            let next = tokio::select! {
                next = inbound.recv() => next,
                _ = ctx.done() => break,
            };
            let Some((peer, stream)) = next else {
                break;
            };
            debug!("Accepted exchange stream from {}", peer);
            let reader = self.clone();
            self.supervisor.spawn_with("exchange-reader", move |ctx| async move {
                reader.read_stream(peer, stream, ctx).await;
            });
        }
    }

    async fn read_stream(self: Arc<Self>, peer: PeerId, mut stream: BoxedStream, ctx: Context) {
        let mut strikes = 0usize;
        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut stream, &self.pool) => frame,
                _ = ctx.done() => return,
            };
            let body = match frame {
                Ok(Some(body)) => body,
                Ok(None) => {
                    debug!("{} closed its exchange stream", peer);
                    self.forget_peer(&peer);
                    return;
                }
                Err(e) => {
                    let category = TransferError::from_io(&e);
                    if category == TransferError::FrameTooLarge {
                        warn!("Disconnecting {}: {}", peer, e);
                        self.network.disconnect(&peer);
                    } else {
                        debug!("Exchange stream from {} ended: {}", peer, e);
                    }
                    self.forget_peer(&peer);
                    return;
                }
            };
            let decoded = decode_body(&body);
            self.pool.put(body);
            match decoded {
                Ok(msg) => {
                    strikes = 0;
                    self.handle_message(peer, msg);
                }
                Err(e) => {
                    strikes += 1;
                    self.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                    warn!("Malformed frame from {} ({}/{}): {}", peer, strikes, self.config.max_malformed_frames, e);
                    if strikes >= self.config.max_malformed_frames {
                        warn!("Disconnecting {} after {} malformed frames", peer, strikes);
                        self.network.disconnect(&peer);
                        self.forget_peer(&peer);
                        return;
                    }
                }
            }
        }
    }

    fn forget_peer(&self, peer: &PeerId) {
        let dropped = self.ledger.remove_peer(peer);
        if dropped > 0 {
            debug!("Dropped {} wants from {}", dropped, peer);
        }
    }

    fn handle_message(self: &Arc<Self>, peer: PeerId, msg: Message) {
        match msg {
            Message::Want(cid) => self.on_want(peer, cid),
            Message::Cancel(cid) => {
                self.ledger.remove(&peer, &cid);
            }
            Message::Have(cid) => self.on_have(peer, cid),
            Message::Block { cid, data } => self.on_block(peer, cid, data),
        }
    }

    fn on_want(self: &Arc<Self>, peer: PeerId, cid: Cid) {
        self.counters.wants_received.fetch_add(1, Ordering::Relaxed);
        let observer = self.observer.read().clone();
        if let Some(observer) = observer {
            observer.on_want(&peer, &cid);
        }
        // Record first so a block stored concurrently is either seen here or
        // finds this want in the ledger.
        self.ledger.add(peer, cid);
        match self.lookup_local(&cid) {
            Ok(Some(block)) => {
                if self.ledger.remove(&peer, &cid) {
                    self.send(peer, Message::from(block));
                }
            }
            Ok(None) => debug!("{} wants {}, not held yet", peer, cid),
            Err(e) => warn!("Store lookup for {} wanted by {} failed: {}", cid, peer, e),
        }
    }

    fn on_block(self: &Arc<Self>, peer: PeerId, cid: Cid, data: Bytes) {
        let block = match Block::with_cid(cid, data) {
            Ok(block) => block,
            Err(e @ CraftBlockError::HashMismatch { .. }) => {
                self.counters.hash_mismatches.fetch_add(1, Ordering::Relaxed);
                warn!("Rejected block from {}: {}", peer, e);
                return;
            }
            Err(e) => {
                warn!("Rejected block {} from {}: {}", cid, peer, e);
                return;
            }
        };
        if !self.is_wanted(&cid) {
            self.counters.unwanted_blocks.fetch_add(1, Ordering::Relaxed);
            debug!("Dropping unwanted block {} from {}", cid, peer);
            return;
        }
        // Waiters and wanting peers only see blocks the store holds. The fetch
        // stays open for another provider.
        if let Err(e) = self.store.put(&block) {
            self.counters.store_failures.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to store block {} from {}: {}", cid, peer, e);
            return;
        }
        self.counters.blocks_received.fetch_add(1, Ordering::Relaxed);
        self.accept_block(&block, Some(peer));
    }
}
