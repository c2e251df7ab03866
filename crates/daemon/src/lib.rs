//! CraftBlock Daemon
//!
//! Background service that runs a CraftBlock node:
//! - libp2p swarm event loop (Kademlia, identify, exchange streams)
//! - Block exchange over the local repo
//! - Reprovider and hot-key announcing

pub mod behaviour;
pub mod commands;
pub mod config;
pub mod events;
pub mod frequency;
pub mod hot_keys;
pub mod logging;
pub mod node;
pub mod reprovider;
pub mod service;
pub mod signals;
