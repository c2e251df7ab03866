//! CraftBlock daemon service
//!
//! Wires the swarm, the block store, the exchange and the reprovider
//! together and runs them until an interrupt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use craftblock_core::{Context, RecursivePins, Supervisor};
use craftblock_exchange::{Exchange, Network};
use craftblock_routing::ContentRouting;
use craftblock_store::{layered, BlockStore, FsStore, RepoHandles, StoreOptions};
use libp2p::identity::Keypair;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::behaviour::build_swarm;
use crate::config::DaemonConfig;
use crate::events::{event_channel, DaemonEvent, EventSender};
use crate::hot_keys::HotKeys;
use crate::node::{accept_exchange_streams, KadRouting, NodeNetwork, SwarmDriver};
use crate::reprovider::{all_keys_provider, pinned_keys_provider, KeyStrategy, Reprovider};
use crate::signals::spawn_interrupt_handler;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Identity key file inside the data directory.
const IDENTITY_FILE: &str = "identity.key";

/// Pin set file inside the data directory.
const PINS_FILE: &str = "pins.json";

/// Block repo directory inside the data directory.
const BLOCKS_DIR: &str = "blocks";

/// Environment variable that pins the data directory.
pub const DATA_DIR_ENV: &str = "CRAFTBLOCK_DATA_DIR";

/// Where the node keeps its repo, identity and config: `$CRAFTBLOCK_DATA_DIR`
/// if set, else `craftblock/` under the per-user data root, else under the
/// system temp dir.
pub fn default_data_dir() -> PathBuf {
    if let Some(dir) = non_empty_env(DATA_DIR_ENV) {
        return dir;
    }
    user_data_root()
        .unwrap_or_else(std::env::temp_dir)
        .join("craftblock")
}

fn non_empty_env(name: &str) -> Option<PathBuf> {
    std::env::var_os(name).filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// `$XDG_DATA_HOME` (or `~/.local/share`) on unix, `~/Library/Application
/// Support` on macOS, `%APPDATA%` on Windows.
fn user_data_root() -> Option<PathBuf> {
    let home = || non_empty_env("HOME");
    if cfg!(target_os = "macos") {
        home().map(|h| h.join("Library").join("Application Support"))
    } else if cfg!(windows) {
        non_empty_env("APPDATA")
    } else if cfg!(unix) {
        non_empty_env("XDG_DATA_HOME").or_else(|| home().map(|h| h.join(".local").join("share")))
    } else {
        None
    }
}

/// Load the node identity from `{data_dir}/identity.key`, generating and
/// saving a fresh ed25519 key on first run.
pub fn load_or_create_keypair(data_dir: &Path) -> Result<Keypair, BoxError> {
    let path = data_dir.join(IDENTITY_FILE);
    if path.exists() {
        let bytes = std::fs::read(&path)?;
        let keypair = Keypair::from_protobuf_encoding(&bytes)?;
        debug!("Loaded identity from {:?}", path);
        return Ok(keypair);
    }
    let keypair = Keypair::generate_ed25519();
    std::fs::create_dir_all(data_dir)?;
    let tmp = path.with_extension("key.tmp");
    std::fs::write(&tmp, keypair.to_protobuf_encoding()?)?;
    std::fs::rename(&tmp, &path)?;
    info!("Generated new identity at {:?}", path);
    Ok(keypair)
}

/// Log every daemon event at debug level as JSON.
fn spawn_event_logger(events: &EventSender, supervisor: &Supervisor) {
    let mut rx = events.subscribe();
    supervisor.spawn_with("event-logger", move |ctx| async move {
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = ctx.done() => break,
            };
            match event {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => debug!("event {}", json),
                    Err(e) => warn!("Failed to encode event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Event logger skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Run the CraftBlock daemon.
///
/// This starts the swarm, exchange and reprovider, then blocks until the
/// first interrupt and shuts them down in order.
pub async fn run_daemon(config: DaemonConfig, data_dir: PathBuf) -> Result<(), BoxError> {
    std::fs::create_dir_all(&data_dir)?;
    let root = Context::background();
    let (events, _) = event_channel(256);
    let supervisor = Supervisor::child_of(&root);
    spawn_event_logger(&events, &supervisor);

    // Storage
    let handles: RepoHandles<FsStore> = RepoHandles::new();
    let blocks_dir = data_dir.join(BLOCKS_DIR);
    let options = StoreOptions {
        hash_on_read: config.hash_on_read,
        ..StoreOptions::default()
    };
    let repo = handles.open(&blocks_dir, |path| FsStore::open_with(path, options))?;
    let store: Arc<dyn BlockStore> = Arc::new(layered(repo, config.rewrite_cross_version));
    let pins = Arc::new(RwLock::new(RecursivePins::load(&data_dir.join(PINS_FILE))?));
    info!("Block repo at {:?}, {} recursive pins", blocks_dir, pins.read().len());

    // Network
    let keypair = load_or_create_keypair(&data_dir)?;
    let swarm = build_swarm(
        keypair,
        config.listen_port,
        &config.boot_peers,
        Duration::from_secs(config.idle_connection_timeout_secs),
    )?;
    let driver = SwarmDriver::new(swarm, events.clone());
    let local = driver.local_peer();
    let mut control = driver.stream_control();
    let inbound = accept_exchange_streams(&mut control, &supervisor)?;
    let (commands, command_rx) = mpsc::unbounded_channel();
    supervisor.spawn_with("swarm", move |ctx| driver.run(command_rx, ctx));

    let routing: Arc<dyn ContentRouting> =
        Arc::new(KadRouting::new(commands.clone()).with_query_timeout(config.provider_query_timeout()));
    let network: Arc<dyn Network> = Arc::new(NodeNetwork::new(local, control, commands));

    // Exchange
    let exchange = Exchange::new(config.exchange_config(), store.clone(), routing.clone(), network, inbound);
    if let Some(hot_config) = config.hot_key_config() {
        let hot_keys = HotKeys::start(hot_config, store.clone(), routing.clone(), Some(events.clone()), &supervisor);
        exchange.set_want_observer(hot_keys);
    }

    // Reprovider
    let keys = match config.reprovide_strategy {
        KeyStrategy::All => all_keys_provider(store.clone()),
        KeyStrategy::Pinned => pinned_keys_provider(pins.clone()),
    };
    let reprovider = Reprovider::start(
        config.reprovider_config(),
        keys,
        routing.clone(),
        Some(events.clone()),
        &root,
    );

    let _signals = spawn_interrupt_handler(root.clone(), Some(events.clone()));
    let _ = events.send(DaemonEvent::DaemonStarted {
        peer_id: local.to_string(),
    });
    info!("CraftBlock daemon running as {}", local);

    root.done().await;

    info!("Shutting down");
    reprovider.close().await;
    exchange.close().await;
    supervisor.close().await;
    if let Err(e) = pins.read().save(&data_dir.join(PINS_FILE)) {
        warn!("Failed to save pins: {}", e);
    }
    handles.close(&blocks_dir);
    info!("CraftBlock daemon stopped");
    Ok(())
}
