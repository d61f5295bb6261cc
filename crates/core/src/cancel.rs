//! Cooperative cancellation shared by a run and its attempts.
//!
//! A [`CancelSource`] is held by the run handle; every attempt carries a
//! cloned [`CancelToken`] and checks it at each suspension point.

use tokio::sync::watch;

/// The cancelling side. Dropping the source without cancelling leaves
/// tokens pending forever, which reads as "never cancelled".
#[derive(Debug)]
pub struct CancelSource {
    tx: watch::Sender<bool>,
}

/// The observing side, cheap to clone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelSource {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    /// Signal every token. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is signalled; never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Source dropped without cancelling: stay pending.
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_token_observes_cancel() {
        let (source, token) = CancelSource::new();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
        // Must resolve promptly.
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .expect("cancelled() should resolve");
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_clones_observe() {
        let (source, token) = CancelSource::new();
        let clone = token.clone();
        source.cancel();
        source.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_uncancelled_token_stays_pending() {
        let (source, token) = CancelSource::new();
        drop(source);
        let result =
            tokio::time::timeout(Duration::from_millis(50), token.cancelled()).await;
        assert!(result.is_err(), "dropped source must not read as cancel");
    }
}
