//! Daemon event broadcast system
//!
//! Typed events pushed to anyone watching the node (tests, log shippers).

use serde::Serialize;
use tokio::sync::broadcast;

/// Events emitted by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum DaemonEvent {
    // -- Node --
    DaemonStarted { peer_id: String },
    ListeningOn { address: String },
    ShutdownRequested,

    // -- Peers --
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },

    // -- Reprovider --
    ReprovideStarted,
    ReprovideFinished { provided: usize, skipped: usize },
    ReprovideFailed { error: String },

    // -- Hot keys --
    HotKeyAnnounced { cid: String },
}

pub type EventSender = broadcast::Sender<DaemonEvent>;
pub type EventReceiver = broadcast::Receiver<DaemonEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(DaemonEvent::ReprovideFinished { provided: 3, skipped: 1 }).unwrap();
        assert_eq!(json["type"], "reprovide_finished");
        assert_eq!(json["data"]["provided"], 3);

        let json = serde_json::to_value(DaemonEvent::ReprovideStarted).unwrap();
        assert_eq!(json["type"], "reprovide_started");
    }
}
