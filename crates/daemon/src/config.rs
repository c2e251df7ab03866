//! Daemon configuration
//!
//! Network, exchange, reprovider and hot-key parameters. Loaded from a JSON
//! file with env var overrides as escape hatch.

use std::path::Path;
use std::time::Duration;

use craftblock_exchange::ExchangeConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::hot_keys::HotKeyConfig;
use crate::reprovider::{BackoffConfig, KeyStrategy, ReproviderConfig};

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Current schema version. Bump when adding/removing/renaming fields.
pub const SCHEMA_VERSION: u32 = 1;

/// Daemon configuration, persisted to `{data_dir}/config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Schema version for migration support.
    pub schema_version: u32,

    // ── Network ─────────────────────────────────────────────
    /// libp2p TCP listen port (0 = random).
    pub listen_port: u16,
    /// Bootstrap peer multiaddrs ending in `/p2p/<peer id>`.
    pub boot_peers: Vec<String>,
    /// Idle connection timeout in seconds.
    pub idle_connection_timeout_secs: u64,
    /// Provider lookup timeout in seconds, independent of caller deadlines.
    pub provider_query_timeout_secs: u64,

    // ── Reprovider ──────────────────────────────────────────
    /// Seconds between reprovide sweeps (0 = only on trigger).
    pub reprovide_interval_secs: u64,
    /// Quiet period after startup before the first sweep.
    pub reprovide_initial_delay_secs: u64,
    /// Which keys to announce: "all" or "pinned".
    pub reprovide_strategy: KeyStrategy,
    /// Give up on a key after retrying for this long.
    pub reprovide_max_backoff_secs: u64,

    // ── Exchange ────────────────────────────────────────────
    /// Providers dialed concurrently per fetch.
    pub exchange_fanout: usize,
    /// Providers requested per lookup (0 = no limit).
    pub provider_query_limit: usize,
    /// Seconds between provider lookups for an unresolved fetch (0 = never repeat).
    pub rebroadcast_interval_secs: u64,
    /// Consecutive malformed frames tolerated before disconnecting a peer.
    pub max_malformed_frames: usize,
    /// Announce blocks as soon as they are stored.
    pub provide_on_has_block: bool,

    // ── Hot keys ────────────────────────────────────────────
    /// Recent inbound WANTs tracked (0 = hot-key announcing disabled).
    pub hot_key_window: usize,
    /// WANTs for one key within the window before it is announced.
    pub hot_key_threshold: usize,

    // ── Storage ─────────────────────────────────────────────
    /// Re-hash blocks when reading them from disk.
    pub hash_on_read: bool,
    /// Store blocks found under another CID version under the requested one.
    pub rewrite_cross_version: bool,

    /// Unknown fields, preserved for forward compatibility.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            listen_port: 0,
            boot_peers: Vec::new(),
            idle_connection_timeout_secs: 300,
            provider_query_timeout_secs: 60,
            reprovide_interval_secs: 12 * 60 * 60,
            reprovide_initial_delay_secs: 60,
            reprovide_strategy: KeyStrategy::All,
            reprovide_max_backoff_secs: 15 * 60,
            exchange_fanout: 6,
            provider_query_limit: 10,
            rebroadcast_interval_secs: 30,
            max_malformed_frames: 3,
            provide_on_has_block: true,
            hot_key_window: 256,
            hot_key_threshold: 8,
            hash_on_read: false,
            rewrite_cross_version: false,
            extra: serde_json::Map::new(),
        }
    }
}

impl DaemonConfig {
    /// Load config from a specific file path, falling back to defaults.
    /// Missing fields are filled from defaults, unknown fields are kept.
    /// A corrupt file is replaced by the defaults.
    pub fn load_from(path: &Path) -> Self {
        let mut config = match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<DaemonConfig>(&data) {
                Ok(mut c) => {
                    info!("Loaded daemon config from {:?} (schema v{})", path, c.schema_version);
                    c.migrate();
                    c
                }
                Err(e) => {
                    warn!("Corrupt config {:?}: {}, using defaults", path, e);
                    let default = Self::default();
                    if let Err(e2) = default.save_to(path) {
                        warn!("Failed to overwrite corrupt config: {}", e2);
                    }
                    default
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {:?}, using defaults", path);
                Self::default()
            }
            Err(e) => {
                warn!("Failed to read config {:?}: {}, using defaults", path, e);
                Self::default()
            }
        };

        config.apply_env_overrides();
        config
    }

    /// Load config from `{data_dir}/config.json`.
    pub fn load(data_dir: &Path) -> Self {
        Self::load_from(&data_dir.join(CONFIG_FILE))
    }

    /// Load `{data_dir}/config.json`, writing the defaults there first when
    /// it does not exist yet. Env overrides apply to the loaded value only.
    pub fn load_or_init(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            match Self::default().save(data_dir) {
                Ok(()) => info!("Wrote default config to {:?}", path),
                Err(e) => warn!("Failed to write default config to {:?}: {}", path, e),
            }
        }
        Self::load(data_dir)
    }

    /// Save config to a specific file path. Creates parent dirs as needed.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Save config to `{data_dir}/config.json`.
    pub fn save(&self, data_dir: &Path) -> std::io::Result<()> {
        self.save_to(&data_dir.join(CONFIG_FILE))
    }

    fn migrate(&mut self) {
        if self.schema_version < SCHEMA_VERSION {
            info!("Migrated config from v{} to v{}", self.schema_version, SCHEMA_VERSION);
        }
        self.schema_version = SCHEMA_VERSION;
    }

    /// Apply environment variable overrides (developer escape hatches only).
    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parse::<u16>("CRAFTBLOCK_LISTEN_PORT") {
            self.listen_port = port;
        }
        if let Ok(val) = std::env::var("CRAFTBLOCK_BOOT_PEERS") {
            let peers: Vec<String> = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !peers.is_empty() {
                debug!("CRAFTBLOCK_BOOT_PEERS override: {:?}", peers);
                self.boot_peers = peers;
            }
        }
        if let Some(secs) = env_parse::<u64>("CRAFTBLOCK_REPROVIDE_INTERVAL") {
            self.reprovide_interval_secs = secs;
        }
        if let Some(secs) = env_parse::<u64>("CRAFTBLOCK_REPROVIDE_INITIAL_DELAY") {
            self.reprovide_initial_delay_secs = secs;
        }
        if let Ok(val) = std::env::var("CRAFTBLOCK_REPROVIDE_STRATEGY") {
            match serde_json::from_value::<KeyStrategy>(Value::String(val.trim().to_lowercase())) {
                Ok(strategy) => self.reprovide_strategy = strategy,
                Err(_) => warn!("Ignoring unknown CRAFTBLOCK_REPROVIDE_STRATEGY={}", val),
            }
        }
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            provider_query_limit: self.provider_query_limit,
            max_outstanding_dials: self.exchange_fanout.max(1),
            rebroadcast_interval: match self.rebroadcast_interval_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            max_malformed_frames: self.max_malformed_frames.max(1),
            provide_on_has_block: self.provide_on_has_block,
        }
    }

    pub fn reprovider_config(&self) -> ReproviderConfig {
        ReproviderConfig {
            interval: Duration::from_secs(self.reprovide_interval_secs),
            initial_delay: Duration::from_secs(self.reprovide_initial_delay_secs),
            backoff: BackoffConfig {
                max_elapsed: Duration::from_secs(self.reprovide_max_backoff_secs),
                ..BackoffConfig::default()
            },
        }
    }

    /// `None` when hot-key announcing is disabled.
    pub fn hot_key_config(&self) -> Option<HotKeyConfig> {
        if self.hot_key_window == 0 {
            return None;
        }
        Some(HotKeyConfig {
            window: self.hot_key_window,
            threshold: self.hot_key_threshold,
            ..HotKeyConfig::default()
        })
    }

    pub fn provider_query_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_query_timeout_secs)
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let val = std::env::var(name).ok()?;
    match val.trim().parse::<T>() {
        Ok(parsed) => {
            debug!("{}={} override", name, val);
            Some(parsed)
        }
        Err(_) => {
            warn!("Ignoring unparsable {}={}", name, val);
            None
        }
    }
}
