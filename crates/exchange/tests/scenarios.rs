//! End-to-end fetches between exchange nodes over the in-memory network.

mod common;

use std::time::Duration;

use craftblock_core::{Context, CraftBlockError};
use craftblock_exchange::ExchangeConfig;
use craftblock_routing::ContentRouting;
use craftblock_store::BlockStore;
use futures::StreamExt;

use common::{block, ctx_secs, eventually, Swarm};

#[tokio::test]
async fn test_local_block_needs_no_network() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let blk = block("already here");
    a.store.put(&blk).unwrap();

    let got = a.exchange.get(&ctx_secs(1), blk.cid()).await.unwrap();
    assert_eq!(got.data(), blk.data());

    let stats = a.exchange.stats();
    assert_eq!(stats.wants_sent, 0);
    assert_eq!(stats.provider_lookups, 0);
    assert_eq!(swarm.overlay.lookup_count(), 0);
    assert_eq!(swarm.net.streams_opened(), 0);
    assert!(!a.exchange.is_pending(blk.cid()));
}

#[tokio::test]
async fn test_block_added_through_has_block_is_served_locally() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let blk = block("handed in");
    a.exchange.has_block(blk.clone()).unwrap();
    assert!(a.store.has(blk.cid()).unwrap());

    let got = a.exchange.get(&ctx_secs(1), blk.cid()).await.unwrap();
    assert_eq!(got.data(), blk.data());

    let stats = a.exchange.stats();
    assert_eq!(stats.wants_sent, 0);
    assert_eq!(stats.provider_lookups, 0);
    assert_eq!(swarm.overlay.lookup_count(), 0);
    assert_eq!(swarm.net.streams_opened(), 0);
    assert!(eventually(|| a.routing.is_providing(blk.cid())).await);
}

#[tokio::test]
async fn test_fetch_from_remote_provider() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let b = swarm.node();
    let blk = block("held by b");
    b.store.put(&blk).unwrap();
    b.routing.provide(&Context::background(), blk.cid(), true).await.unwrap();

    let got = a.exchange.get(&ctx_secs(5), blk.cid()).await.unwrap();
    assert_eq!(got.cid(), blk.cid());
    assert_eq!(got.data(), blk.data());

    // Fetched blocks are stored locally and the fetch is settled.
    assert!(a.store.has(blk.cid()).unwrap());
    assert!(a.exchange.wantlist().is_empty());
    assert!(b.exchange.wantlist_for_peer(&a.peer).is_empty());
    assert!(eventually(|| b.exchange.stats().blocks_sent == 1).await);
    assert_eq!(a.exchange.stats().blocks_received, 1);
}

#[tokio::test]
async fn test_fetched_block_is_provided_again() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let b = swarm.node();
    let blk = block("spreads");
    b.store.put(&blk).unwrap();
    b.routing.provide(&Context::background(), blk.cid(), true).await.unwrap();

    a.exchange.get(&ctx_secs(5), blk.cid()).await.unwrap();
    assert!(eventually(|| swarm.overlay.provider_count(blk.cid()) == 2).await);
    assert!(a.routing.is_providing(blk.cid()));
}

#[tokio::test]
async fn test_concurrent_gets_share_one_fetch() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let b = swarm.node();
    let blk = block("popular");
    b.store.put(&blk).unwrap();
    b.routing.provide(&Context::background(), blk.cid(), true).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..50 {
        let exchange = a.exchange.clone();
        let cid = *blk.cid();
        handles.push(tokio::spawn(async move { exchange.get(&ctx_secs(5), &cid).await }));
    }
    for handle in handles {
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.data(), blk.data());
    }

    assert_eq!(a.exchange.stats().wants_sent, 1);
    assert_eq!(a.exchange.stats().provider_lookups, 1);
    assert_eq!(swarm.overlay.lookup_count(), 1);
    assert!(eventually(|| b.exchange.stats().wants_received == 1).await);
    assert_eq!(a.exchange.pending_count(), 0);
    assert_eq!(a.exchange.subscriber_count(blk.cid()), 0);
}

#[tokio::test]
async fn test_deadline_cancels_fetch_and_tells_provider() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let b = swarm.node();
    let blk = block("nobody has this");
    // B claims the block but never had it.
    b.routing.provide(&Context::background(), blk.cid(), true).await.unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(200));
    let err = a.exchange.get(&ctx, blk.cid()).await.unwrap_err();
    assert!(matches!(err, CraftBlockError::DeadlineExceeded), "got {:?}", err);
    assert!(!a.exchange.is_pending(blk.cid()));

    assert!(eventually(|| b.exchange.stats().wants_received == 1).await);
    assert!(eventually(|| a.exchange.stats().cancels_sent == 1).await);
    assert!(eventually(|| b.exchange.wanting_peer_count() == 0).await);
    assert_eq!(a.exchange.stats().wants_sent, 1);
}

#[tokio::test]
async fn test_cancelled_context_fails_immediately() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let blk = block("never asked");
    let ctx = Context::background();
    ctx.cancel();

    let err = a.exchange.get(&ctx, blk.cid()).await.unwrap_err();
    assert!(matches!(err, CraftBlockError::Cancelled));
    assert_eq!(a.exchange.pending_count(), 0);
    assert_eq!(a.exchange.stats().provider_lookups, 0);
}

#[tokio::test]
async fn test_one_waiter_leaving_keeps_fetch_for_others() {
    let swarm = Swarm::new();
    let a = swarm.node_with(ExchangeConfig {
        rebroadcast_interval: None,
        ..ExchangeConfig::default()
    });
    let blk = block("added later");
    let cid = *blk.cid();

    let short = Context::background().with_timeout(Duration::from_millis(50));
    let exchange = a.exchange.clone();
    let patient = tokio::spawn(async move { exchange.get(&ctx_secs(5), &cid).await });

    assert!(eventually(|| a.exchange.is_pending(&cid)).await);
    assert!(a.exchange.get(&short, &cid).await.is_err());
    assert!(a.exchange.is_pending(&cid));

    a.exchange.has_block(blk.clone()).unwrap();
    let got = patient.await.unwrap().unwrap();
    assert_eq!(got.data(), blk.data());
    assert!(!a.exchange.is_pending(&cid));
}

#[tokio::test]
async fn test_has_block_wakes_waiters() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let blk = block("produced locally");
    let cid = *blk.cid();

    let exchange = a.exchange.clone();
    let waiter = tokio::spawn(async move { exchange.get(&ctx_secs(5), &cid).await });
    assert!(eventually(|| a.exchange.is_pending(&cid)).await);

    a.exchange.has_block(blk.clone()).unwrap();
    assert_eq!(waiter.await.unwrap().unwrap().data(), blk.data());
    assert!(a.store.has(&cid).unwrap());
    assert!(eventually(|| a.routing.is_providing(&cid)).await);
}

#[tokio::test]
async fn test_get_many_yields_available_blocks() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let b = swarm.node();
    let local = block("local one");
    let remote = block("remote one");
    let missing = block("missing one");
    a.store.put(&local).unwrap();
    b.store.put(&remote).unwrap();
    b.routing.provide(&Context::background(), remote.cid(), true).await.unwrap();

    let ctx = Context::background().with_timeout(Duration::from_millis(500));
    let cids = [*local.cid(), *remote.cid(), *missing.cid(), *local.cid()];
    let mut got: Vec<_> = a.exchange.get_many(&ctx, &cids).map(|b| *b.cid()).collect().await;
    got.sort();
    let mut expected = vec![*local.cid(), *remote.cid()];
    expected.sort();
    assert_eq!(got, expected);
    assert!(!a.exchange.is_pending(missing.cid()));
}

#[tokio::test]
async fn test_fetch_across_cid_versions_by_multihash() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let b = swarm.node();
    let blk = block("v0 block");
    b.store.put(&blk).unwrap();
    b.routing.provide(&Context::background(), blk.cid(), true).await.unwrap();

    // Providers are keyed by multihash, so a v1 dag-pb lookup finds B.
    let v1 = craftblock_core::content_id::other_versions(blk.cid())[0];
    let providers: Vec<_> = a
        .routing
        .find_providers_async(&Context::background(), &v1, 10)
        .collect()
        .await;
    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].peer, b.peer);
}

#[tokio::test]
async fn test_close_fails_outstanding_gets() {
    let swarm = Swarm::new();
    let a = swarm.node();
    let blk = block("never arrives");
    let cid = *blk.cid();

    let exchange = a.exchange.clone();
    let waiter = tokio::spawn(async move { exchange.get(&ctx_secs(5), &cid).await });
    assert!(eventually(|| a.exchange.is_pending(&cid)).await);

    a.exchange.close().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, CraftBlockError::Closed), "got {:?}", err);
    assert_eq!(a.exchange.pending_count(), 0);

    let err = a.exchange.get(&ctx_secs(1), &cid).await.unwrap_err();
    assert!(matches!(err, CraftBlockError::Closed));
}
