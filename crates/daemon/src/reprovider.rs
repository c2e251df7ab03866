//! Reprovider loop
//!
//! Periodically re-announces every locally owned key to the routing system,
//! and on demand through [`Reprovider::trigger`]. One sweep runs at a time;
//! triggers that arrive during a sweep fail with `AlreadyRunning`.

use std::sync::Arc;
use std::time::Duration;

use craftblock_core::content_id::{is_identity, validate_cid};
use craftblock_core::{Cid, Context, CraftBlockError, RecursivePins, Result, Supervisor};
use craftblock_routing::ContentRouting;
use craftblock_store::{keys_until_done, BlockStore, KeyStream};
use futures::future::{self, BoxFuture, FutureExt};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::events::{DaemonEvent, EventSender};

/// Which keys a sweep announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Every block in the store.
    #[default]
    All,
    /// Roots of the recursive pin set.
    Pinned,
}

/// Produces the keys for one sweep.
pub type KeyProvider = Arc<dyn Fn(Context) -> BoxFuture<'static, Result<KeyStream>> + Send + Sync>;

pub fn all_keys_provider(store: Arc<dyn BlockStore>) -> KeyProvider {
    Arc::new(move |ctx: Context| {
        let store = store.clone();
        async move { store.all_keys(&ctx) }.boxed()
    })
}

pub fn pinned_keys_provider(pins: Arc<RwLock<RecursivePins>>) -> KeyProvider {
    Arc::new(move |ctx: Context| {
        let keys: Vec<Cid> = pins.read().keys().copied().collect();
        future::ready(Ok(keys_until_done(&ctx, keys))).boxed()
    })
}

/// Per-key retry schedule for provide calls.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: u32,
    /// Give up once this much time has passed since the first attempt.
    pub max_elapsed: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(60),
            multiplier: 2,
            max_elapsed: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReproviderConfig {
    /// Time between periodic sweeps. Zero disables them; triggers still work.
    pub interval: Duration,
    /// Quiet period before the first periodic sweep.
    pub initial_delay: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ReproviderConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(12 * 60 * 60),
            initial_delay: Duration::from_secs(60),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Outcome of a completed sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub provided: usize,
    pub skipped: usize,
}

type TriggerReply = oneshot::Sender<Result<()>>;

struct Inner {
    config: ReproviderConfig,
    keys: KeyProvider,
    routing: Arc<dyn ContentRouting>,
    events: Option<EventSender>,
}

pub struct Reprovider {
    triggers: mpsc::Sender<TriggerReply>,
    supervisor: Supervisor,
}

impl Reprovider {
    /// Start the loop under `parent`. It stops when `parent` completes or
    /// [`Reprovider::close`] is called.
    pub fn start(
        config: ReproviderConfig,
        keys: KeyProvider,
        routing: Arc<dyn ContentRouting>,
        events: Option<EventSender>,
        parent: &Context,
    ) -> Self {
        let (triggers, rx) = mpsc::channel(16);
        let supervisor = Supervisor::child_of(parent);
        let inner = Arc::new(Inner {
            config,
            keys,
            routing,
            events,
        });
        supervisor.spawn_with("reprovider", move |ctx| inner.run(rx, ctx));
        Self { triggers, supervisor }
    }

    /// Run a sweep now and wait for it. Fails with `AlreadyRunning` if a
    /// sweep is in progress.
    pub async fn trigger(&self, ctx: &Context) -> Result<()> {
        let closing = self.supervisor.context();
        let (reply_tx, reply_rx) = oneshot::channel();
        tokio::select! {
            sent = self.triggers.send(reply_tx) => sent.map_err(|_| CraftBlockError::Closed)?,
            e = ctx.done() => return Err(e.into()),
            _ = closing.done() => return Err(CraftBlockError::Closed),
        }
        tokio::select! {
            reply = reply_rx => reply.map_err(|_| CraftBlockError::Closed)?,
            e = ctx.done() => Err(e.into()),
            _ = closing.done() => Err(CraftBlockError::Closed),
        }
    }

    pub async fn close(&self) {
        self.supervisor.close().await;
    }
}

impl Inner {
    async fn run(self: Arc<Self>, mut triggers: mpsc::Receiver<TriggerReply>, ctx: Context) {
        let periodic = !self.config.interval.is_zero();
        let mut next = Instant::now() + self.config.initial_delay;
        let mut open = true;
        loop {
            let reply = tokio::select! {
                _ = ctx.done() => break,
                t = triggers.recv(), if open => match t {
                    Some(reply) => Some(reply),
                    None => {
                        open = false;
                        if !periodic {
                            break;
                        }
                        continue;
                    }
                },
                _ = tokio::time::sleep_until(next), if periodic => None,
            };

            self.emit(DaemonEvent::ReprovideStarted);
            let sweep = self.reprovide(&ctx);
            tokio::pin!(sweep);
            let result = loop {
                tokio::select! {
                    r = &mut sweep => break r,
                    t = triggers.recv(), if open => match t {
                        Some(late) => {
                            let _ = late.send(Err(CraftBlockError::AlreadyRunning));
                        }
                        None => open = false,
                    },
                }
            };

            match &result {
                Ok(report) => {
                    info!("Reprovide sweep done: {} provided, {} skipped", report.provided, report.skipped);
                    self.emit(DaemonEvent::ReprovideFinished {
                        provided: report.provided,
                        skipped: report.skipped,
                    });
                }
                Err(e) => {
                    warn!("Reprovide sweep aborted: {}", e);
                    self.emit(DaemonEvent::ReprovideFailed { error: e.to_string() });
                }
            }
            if let Some(reply) = reply {
                let _ = reply.send(result.map(|_| ()));
            }
            next = Instant::now() + self.config.interval;
        }
        debug!("Reprovider stopped");
    }

    fn emit(&self, event: DaemonEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn reprovide(&self, ctx: &Context) -> Result<SweepReport> {
        let mut keys = (self.keys)(ctx.clone()).await?;
        let mut report = SweepReport::default();
        while let Some(cid) = keys.next().await {
            if let Err(e) = validate_cid(&cid) {
                debug!("Skipping {}: {}", cid, e);
                report.skipped += 1;
                continue;
            }
            if is_identity(&cid) {
                report.skipped += 1;
                continue;
            }
            self.provide_with_backoff(ctx, &cid).await?;
            report.provided += 1;
        }
        // The key stream also ends early on cancellation.
        if let Some(e) = ctx.err() {
            return Err(e.into());
        }
        Ok(report)
    }

    async fn provide_with_backoff(&self, ctx: &Context, cid: &Cid) -> Result<()> {
        let backoff = &self.config.backoff;
        let started = Instant::now();
        let mut delay = backoff.initial;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.routing.provide(ctx, cid, true).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_context() || matches!(e, CraftBlockError::Closed) => return Err(e),
                Err(e) => e,
            };
            if started.elapsed() + delay > backoff.max_elapsed {
                warn!("Giving up providing {} after {} attempts: {}", cid, attempt, err);
                return Err(err);
            }
            debug!("Provide {} failed (attempt {}), retrying in {:?}: {}", cid, attempt, delay, err);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                e = ctx.done() => return Err(e.into()),
            }
            delay = (delay * backoff.multiplier).min(backoff.max);
        }
    }
}
