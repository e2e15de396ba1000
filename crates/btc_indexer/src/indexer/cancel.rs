//! Cancellation for in-flight indexer calls.

use crate::error::IndexError;
use std::future::Future;
use tokio::sync::watch;

/// Fires every [`CancelToken`] created with it. Dropping the handle without cancelling
/// leaves the tokens live forever.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; pends forever if the handle is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Run `fut` unless the token fires first.
    pub(crate) async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, IndexError> {
        if self.is_cancelled() {
            return Err(IndexError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(IndexError::Cancelled),
            out = fut => Ok(out),
        }
    }
}
