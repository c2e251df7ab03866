//! Interrupt handling: the first signal starts a graceful shutdown, the
//! second exits immediately.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use craftblock_core::Context;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::events::{DaemonEvent, EventSender};

/// Exit code when a second signal cuts shutdown short.
pub const FORCED_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    Shutdown,
    ForceExit,
}

/// Counts signals received during one run.
#[derive(Debug, Default)]
pub struct InterruptCounter {
    received: AtomicUsize,
}

impl InterruptCounter {
    pub fn on_signal(&self) -> SignalAction {
        match self.received.fetch_add(1, Ordering::SeqCst) {
            0 => SignalAction::Shutdown,
            _ => SignalAction::ForceExit,
        }
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Watch for signals for the rest of the process: cancel `root` on the
/// first, exit with [`FORCED_EXIT_CODE`] on the second.
pub fn spawn_interrupt_handler(root: Context, events: Option<EventSender>) -> JoinHandle<()> {
    let counter = Arc::new(InterruptCounter::default());
    tokio::spawn(async move {
        loop {
            if let Err(e) = wait_for_signal().await {
                error!("Cannot listen for signals: {}", e);
                return;
            }
            match counter.on_signal() {
                SignalAction::Shutdown => {
                    warn!("Received interrupt, shutting down (interrupt again to force)");
                    if let Some(tx) = &events {
                        let _ = tx.send(DaemonEvent::ShutdownRequested);
                    }
                    root.cancel();
                }
                SignalAction::ForceExit => {
                    error!("Received second interrupt, exiting now");
                    std::process::exit(FORCED_EXIT_CODE);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_signal_forces_exit() {
        let counter = InterruptCounter::default();
        assert_eq!(counter.on_signal(), SignalAction::Shutdown);
        assert_eq!(counter.on_signal(), SignalAction::ForceExit);
        assert_eq!(counter.on_signal(), SignalAction::ForceExit);
        assert_eq!(counter.received(), 3);
    }
}
