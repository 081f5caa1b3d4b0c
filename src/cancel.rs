//! Cooperative cancellation
//!
//! A [`CancellationToken`] is shared by a caller and the coordinators it
//! starts. Coordinators observe it with `tokio::select!` and abort their
//! workers when it fires.

use crate::error::{Result, TransferError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancellation flag backed by a watch channel
#[derive(Debug, Clone)]
pub struct CancellationToken {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl CancellationToken {
    /// Create a token that is not cancelled
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Cancel every clone of this token
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once the token is cancelled
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone, so `changed` only fails
        // after every token is gone.
        while !*receiver.borrow_and_update() {
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Run `future` unless `token` fires first
pub async fn until_cancelled<T>(
    token: Option<&CancellationToken>,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransferError::Cancelled),
            result = future => result,
        },
        None => future.await,
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
