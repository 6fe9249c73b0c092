//! Cooperative cancellation and the signal-driven shutdown hook.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;

/// Why the root context was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Operator signal (`SIGINT` / `SIGTERM`), carrying the signal name.
    Signal(String),
    /// The orchestrator or deadline asked us to stop.
    Requested,
}

/// Cancelling half. Dropping it does not cancel.
pub struct CancelHandle {
    tx: watch::Sender<Option<CancelReason>>,
}

/// Cloneable observing half, checked at every suspension point.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(None);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.tx.send(Some(reason));
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.rx.borrow().clone()
    }

    /// Resolve once cancellation fires. Usable inside `tokio::select!`.
    pub async fn cancelled(&mut self) {
        loop {
            if self.rx.borrow().is_some() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling: park forever so selects
                // fall through to the other branches.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Listen for SIGINT/SIGTERM and cancel the root context with the signal
/// name. The worker's run loop then flushes and writes `interrupted`.
pub fn spawn_signal_handler(handle: CancelHandle) -> std::io::Result<()> {
    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
        };
        info!(signal = name, "shutdown signal received");
        handle.cancel(CancelReason::Signal(name.to_string()));
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn token_observes_cancellation() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        handle.cancel(CancelReason::Signal("SIGTERM".to_string()));
        assert!(token.is_cancelled());
        assert_eq!(
            token.reason(),
            Some(CancelReason::Signal("SIGTERM".to_string()))
        );
    }

    #[tokio::test]
    async fn cancelled_future_resolves_on_cancel() {
        let (handle, token) = cancel_pair();
        let mut waiting = token.clone();
        let waiter = tokio::spawn(async move { waiting.cancelled().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel(CancelReason::Requested);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn clones_share_the_same_state() {
        let (handle, token) = cancel_pair();
        let clone = token.clone();
        handle.cancel(CancelReason::Requested);
        assert!(clone.is_cancelled());
    }
}
