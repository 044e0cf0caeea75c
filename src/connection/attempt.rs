//! Handles to the concurrently running connector, acceptor and pump tasks

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A spawned attempt, identified by a manager-unique id.
///
/// Dropping the handle signals cancellation but does not wait for the task;
/// use [`AttemptHandle::cancel`] to wait for it to finish.
pub(crate) struct AttemptHandle {
    id: u64,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl AttemptHandle {
    pub(crate) fn new(id: u64, token: CancellationToken, task: JoinHandle<()>) -> Self {
        Self { id, token, task }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal cancellation without waiting
    pub(crate) fn signal(&self) {
        self.token.cancel();
    }

    /// Cancel the task and wait until it has released its resources
    pub(crate) async fn cancel(mut self) {
        self.token.cancel();
        if let Err(e) = (&mut self.task).await {
            if e.is_panic() {
                warn!("[LINK] Attempt {} panicked: {}", self.id, e);
            }
        }
    }
}

impl Drop for AttemptHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_waits_for_task() {
        let token = CancellationToken::new();
        let cleaned_up = Arc::new(AtomicBool::new(false));
        let flag = cleaned_up.clone();
        let child = token.clone();
        let task = tokio::spawn(async move {
            child.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });

        let handle = AttemptHandle::new(7, token, task);
        assert_eq!(handle.id(), 7);
        handle.cancel().await;
        assert!(cleaned_up.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_signals_cancellation() {
        let token = CancellationToken::new();
        let observer = token.clone();
        let child = token.clone();
        let task = tokio::spawn(async move { child.cancelled().await });

        drop(AttemptHandle::new(1, token, task));
        assert!(observer.is_cancelled());
    }
}
