//! Hot-key announcing.
//!
//! Every inbound WANT is fed to a [`FrequencyFilter`]. Keys peers keep asking
//! for that we hold are announced ahead of the next reprovide sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use craftblock_core::{Cid, Context, Supervisor};
use craftblock_exchange::WantObserver;
use craftblock_routing::ContentRouting;
use craftblock_store::BlockStore;
use libp2p::PeerId;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::events::{DaemonEvent, EventSender};
use crate::frequency::FrequencyFilter;

#[derive(Debug, Clone)]
pub struct HotKeyConfig {
    /// Recent WANTs remembered.
    pub window: usize,
    /// Sightings in the window before a key counts as hot.
    pub threshold: usize,
    /// Minimum time between two announcements of the same key.
    pub cooldown: Duration,
}

impl Default for HotKeyConfig {
    fn default() -> Self {
        Self {
            window: 256,
            threshold: 8,
            cooldown: Duration::from_secs(10 * 60),
        }
    }
}

pub struct HotKeys {
    filter: FrequencyFilter,
}

impl HotKeys {
    /// Build the filter and spawn the announcer under `supervisor`.
    pub fn start(
        config: HotKeyConfig,
        store: Arc<dyn BlockStore>,
        routing: Arc<dyn ContentRouting>,
        events: Option<EventSender>,
        supervisor: &Supervisor,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let filter = FrequencyFilter::new(
            config.window,
            config.threshold,
            Arc::new(move |cid: &Cid| {
                let _ = tx.send(*cid);
            }),
        );
        let announcer = Announcer {
            store,
            routing,
            events,
            cooldown: config.cooldown,
            last: HashMap::new(),
        };
        supervisor.spawn_with("hot-key-announcer", move |ctx| announcer.run(rx, ctx));
        Arc::new(Self { filter })
    }

    pub fn filter(&self) -> &FrequencyFilter {
        &self.filter
    }
}

impl WantObserver for HotKeys {
    fn on_want(&self, _peer: &PeerId, cid: &Cid) {
        self.filter.add_key(*cid);
    }
}

struct Announcer {
    store: Arc<dyn BlockStore>,
    routing: Arc<dyn ContentRouting>,
    events: Option<EventSender>,
    cooldown: Duration,
    last: HashMap<Cid, Instant>,
}

impl Announcer {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Cid>, ctx: Context) {
        loop {
            let cid = tokio::select! {
                cid = rx.recv() => match cid {
                    Some(cid) => cid,
                    None => break,
                },
                _ = ctx.done() => break,
            };
            self.announce(&ctx, cid).await;
        }
    }

    async fn announce(&mut self, ctx: &Context, cid: Cid) {
        let now = Instant::now();
        if let Some(at) = self.last.get(&cid) {
            if now.duration_since(*at) < self.cooldown {
                return;
            }
        }
        match self.store.has(&cid) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                debug!("Hot key {} lookup failed: {}", cid, e);
                return;
            }
        }
        self.last.retain(|_, at| now.duration_since(*at) < self.cooldown);
        self.last.insert(cid, now);
        match self.routing.provide(ctx, &cid, true).await {
            Ok(()) => {
                info!("Announced hot key {}", cid);
                if let Some(tx) = &self.events {
                    let _ = tx.send(DaemonEvent::HotKeyAnnounced { cid: cid.to_string() });
                }
            }
            Err(e) => debug!("Hot key announce for {} failed: {}", cid, e),
        }
    }
}
