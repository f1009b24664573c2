use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

/// An action that runs once after a delay unless it is cancelled first.
///
/// Dropping the handle cancels the action, so replacing a stored `DelayedAction` with a new
/// one restarts the delay.
#[derive(Debug)]
pub struct DelayedAction {
    handle: JoinHandle<()>,
}

impl DelayedAction {
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            action();
        });
        DelayedAction { handle }
    }

    /// `true` until the action has run or been cancelled.
    pub fn is_pending(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Returns whether the action was still pending.
    pub fn cancel(self) -> bool {
        // Drop aborts the task.
        self.is_pending()
    }
}

impl Drop for DelayedAction {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_runs_after_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let action = DelayedAction::schedule(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(999)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(action.is_pending());

        tokio::time::sleep(Duration::from_millis(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!action.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_drop_prevent_run() {
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let cancelled = DelayedAction::schedule(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(cancelled.cancel());

        let counter = runs.clone();
        let mut slot = DelayedAction::schedule(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = runs.clone();
        let previous = std::mem::replace(
            &mut slot,
            DelayedAction::schedule(Duration::from_secs(2), move || {
                counter.fetch_add(10, Ordering::SeqCst);
            }),
        );
        drop(previous);

        tokio::time::sleep(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 10);
        assert!(!slot.is_pending());
    }
}
