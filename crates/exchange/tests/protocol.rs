//! Frame-level behaviour of an exchange node towards a scripted peer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use craftblock_core::{Block, Cid, Context, CraftBlockError, Result};
use craftblock_exchange::ExchangeConfig;
use craftblock_store::{BlockStore, KeyStream, MemoryStore};
use craftblock_transfer::wire::encode_uvarint;
use craftblock_transfer::Message;

use common::{block, ctx_secs, eventually, Swarm};

#[tokio::test]
async fn test_forged_block_rejected_then_real_block_accepted() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let mut mallory = swarm.raw_peer();
    let blk = block("genuine content");
    let cid = *blk.cid();
    mallory.announce(&cid).await;

    let exchange = a.exchange.clone();
    let waiter = tokio::spawn(async move { exchange.get(&ctx_secs(5), &cid).await });

    let (from, mut incoming) = mallory.accept().await;
    assert_eq!(from, a.peer);
    assert_eq!(mallory.next_message(&mut incoming).await, Message::Want(cid));

    let forged = Message::Block {
        cid,
        data: Bytes::from_static(b"forged content"),
    };
    mallory.send(a.peer, &forged).await;
    assert!(eventually(|| a.exchange.stats().hash_mismatches == 1).await);
    assert!(!a.store.has(&cid).unwrap());
    assert!(a.exchange.is_pending(&cid));
    assert!(!waiter.is_finished());

    mallory.send(a.peer, &Message::from(blk.clone())).await;
    let got = waiter.await.unwrap().unwrap();
    assert_eq!(got.data(), blk.data());
    assert!(a.store.has(&cid).unwrap());
}

#[tokio::test]
async fn test_want_for_held_block_is_served() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let mut peer = swarm.raw_peer();
    let blk = block("served");
    a.store.put(&blk).unwrap();

    peer.send(a.peer, &Message::Want(*blk.cid())).await;
    let (from, mut incoming) = peer.accept().await;
    assert_eq!(from, a.peer);
    assert_eq!(peer.next_message(&mut incoming).await, Message::from(blk.clone()));
    assert!(a.exchange.wantlist_for_peer(&peer.peer).is_empty());
    assert!(eventually(|| a.exchange.stats().blocks_sent == 1).await);
}

#[tokio::test]
async fn test_want_is_served_when_block_arrives() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let mut peer = swarm.raw_peer();
    let blk = block("not yet");

    peer.send(a.peer, &Message::Want(*blk.cid())).await;
    assert!(eventually(|| a.exchange.wantlist_for_peer(&peer.peer) == vec![*blk.cid()]).await);

    a.exchange.has_block(blk.clone()).unwrap();
    let (_, mut incoming) = peer.accept().await;
    assert_eq!(peer.next_message(&mut incoming).await, Message::from(blk.clone()));
    assert!(a.exchange.wantlist_for_peer(&peer.peer).is_empty());
}

#[tokio::test]
async fn test_cancel_clears_peer_want() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let mut peer = swarm.raw_peer();
    let blk = block("changed my mind");

    peer.send(a.peer, &Message::Want(*blk.cid())).await;
    assert!(eventually(|| a.exchange.wanting_peer_count() == 1).await);
    peer.send(a.peer, &Message::Cancel(*blk.cid())).await;
    assert!(eventually(|| a.exchange.wanting_peer_count() == 0).await);
}

#[tokio::test]
async fn test_have_for_pending_block_triggers_want() {
    let swarm = Swarm::new();
    let a = swarm.node_with(ExchangeConfig {
        rebroadcast_interval: None,
        ..ExchangeConfig::default()
    });
    let mut peer = swarm.raw_peer();
    let blk = block("announced by have");
    let cid = *blk.cid();

    let exchange = a.exchange.clone();
    let waiter = tokio::spawn(async move { exchange.get(&ctx_secs(5), &cid).await });
    assert!(eventually(|| a.exchange.is_pending(&cid)).await);

    peer.send(a.peer, &Message::Have(cid)).await;
    let (_, mut incoming) = peer.accept().await;
    assert_eq!(peer.next_message(&mut incoming).await, Message::Want(cid));

    peer.send(a.peer, &Message::from(blk.clone())).await;
    assert_eq!(waiter.await.unwrap().unwrap().data(), blk.data());
}

#[tokio::test]
async fn test_unwanted_block_is_dropped() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let mut peer = swarm.raw_peer();
    let blk = block("unsolicited");

    peer.send(a.peer, &Message::from(blk.clone())).await;
    assert!(eventually(|| a.exchange.stats().unwanted_blocks == 1).await);
    assert!(!a.store.has(blk.cid()).unwrap());
    assert_eq!(a.exchange.stats().blocks_received, 0);
}

#[tokio::test]
async fn test_repeated_malformed_frames_disconnect_peer() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let mut peer = swarm.raw_peer();
    let pending = block("wanted before misbehaving");

    peer.send(a.peer, &Message::Want(*pending.cid())).await;
    assert!(eventually(|| a.exchange.wanting_peer_count() == 1).await);

    // Three one-byte frames carrying an unknown message type.
    peer.send_raw(a.peer, &[1, 0x7f, 1, 0x7f, 1, 0x7f]).await;
    assert!(eventually(|| swarm.net.disconnects() == 1).await);
    assert_eq!(a.exchange.stats().malformed_frames, 3);
    assert_eq!(a.exchange.wanting_peer_count(), 0);
}

#[tokio::test]
async fn test_single_malformed_frame_is_tolerated() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let mut peer = swarm.raw_peer();
    let blk = block("still served");
    a.store.put(&blk).unwrap();

    peer.send_raw(a.peer, &[1, 0x7f]).await;
    peer.send(a.peer, &Message::Want(*blk.cid())).await;
    let (_, mut incoming) = peer.accept().await;
    assert_eq!(peer.next_message(&mut incoming).await, Message::from(blk.clone()));
    assert_eq!(a.exchange.stats().malformed_frames, 1);
    assert_eq!(swarm.net.disconnects(), 0);
}

#[tokio::test]
async fn test_oversized_frame_disconnects_peer() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let mut peer = swarm.raw_peer();

    let mut header = Vec::new();
    encode_uvarint((craftblock_core::MAX_FRAME_SIZE + 1) as u64, &mut header);
    peer.send_raw(a.peer, &header).await;
    assert!(eventually(|| swarm.net.disconnects() == 1).await);
}

/// Reads pass through; every write fails.
struct ReadOnlyStore(Arc<MemoryStore>);

impl BlockStore for ReadOnlyStore {
    fn has(&self, cid: &Cid) -> Result<bool> {
        self.0.has(cid)
    }

    fn get(&self, cid: &Cid) -> Result<Block> {
        self.0.get(cid)
    }

    fn put(&self, _block: &Block) -> Result<()> {
        Err(CraftBlockError::Storage("disk full".into()))
    }

    fn delete(&self, cid: &Cid) -> Result<()> {
        self.0.delete(cid)
    }

    fn all_keys(&self, ctx: &Context) -> Result<KeyStream> {
        self.0.all_keys(ctx)
    }
}

#[tokio::test]
async fn test_unstored_block_is_not_delivered_or_served() {
    let swarm = Swarm::new();
    let a = swarm.node_over(ExchangeConfig::default(), |store| Arc::new(ReadOnlyStore(store)));
    let mut provider = swarm.raw_peer();
    let mut wanter = swarm.raw_peer();
    let blk = block("nowhere to put it");
    let cid = *blk.cid();
    provider.announce(&cid).await;

    let exchange = a.exchange.clone();
    let waiter = tokio::spawn(async move { exchange.get(&ctx_secs(5), &cid).await });
    let (_, mut incoming) = provider.accept().await;
    assert_eq!(provider.next_message(&mut incoming).await, Message::Want(cid));

    wanter.send(a.peer, &Message::Want(cid)).await;
    assert!(eventually(|| a.exchange.wantlist_for_peer(&wanter.peer) == vec![cid]).await);

    provider.send(a.peer, &Message::from(blk.clone())).await;
    assert!(eventually(|| a.exchange.stats().store_failures == 1).await);

    assert!(a.exchange.is_pending(&cid));
    assert!(!waiter.is_finished());
    assert_eq!(a.exchange.stats().blocks_received, 0);
    assert_eq!(a.exchange.wantlist_for_peer(&wanter.peer), vec![cid]);
    assert!(tokio::time::timeout(Duration::from_millis(200), wanter.inbound.recv())
        .await
        .is_err());
    assert_eq!(a.exchange.stats().blocks_sent, 0);
    assert!(!a.routing.is_providing(&cid));
    waiter.abort();
}
