//! Delayed, jittered re-execution of failed sync steps.
//!
//! Tasks live in memory, one pending task per document (a new schedule call
//! replaces the pending one). Cancellation removes pending tasks; a task that
//! has already started running is not interrupted here, the engine's cancel
//! flag covers in-flight work.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::classifier::{ErrorCategory, RetryStrategy};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub scheduled: u64,
    pub executed: u64,
    pub cancelled: u64,
    pub replaced: u64,
}

struct PendingTask {
    task_id: u64,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
pub struct RetryScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    tasks: DashMap<String, PendingTask>,
    next_id: AtomicU64,
    scheduled: AtomicU64,
    executed: AtomicU64,
    cancelled: AtomicU64,
    replaced: AtomicU64,
}

impl Default for RetryScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                tasks: DashMap::new(),
                next_id: AtomicU64::new(1),
                scheduled: AtomicU64::new(0),
                executed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                replaced: AtomicU64::new(0),
            }),
        }
    }

    /// Schedule `run` after the strategy delay for 1-indexed `attempt`.
    /// Replaces any pending retry for the same document.
    pub fn schedule_retry<F, Fut>(
        &self,
        doc_id: &str,
        category: ErrorCategory,
        attempt: u32,
        strategy: &RetryStrategy,
        run: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let delay = strategy.delay_for_attempt(attempt.max(1));
        let task_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        // The task waits for registration before sleeping, so a zero delay
        // cannot race the map insert below.
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let doc = doc_id.to_string();
        let handle = tokio::spawn(async move {
            if ready_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            // Move from pending to in-flight; a replaced task finds someone
            // else's id and backs off.
            let still_ours = inner
                .tasks
                .remove_if(&doc, |_, task| task.task_id == task_id)
                .is_some();
            if !still_ours {
                return;
            }
            inner.executed.fetch_add(1, Ordering::Relaxed);
            run().await;
        });

        if let Some(previous) = self.inner.tasks.insert(
            doc_id.to_string(),
            PendingTask { task_id, handle },
        ) {
            previous.handle.abort();
            self.inner.replaced.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.scheduled.fetch_add(1, Ordering::Relaxed);
        let _ = ready_tx.send(());

        tracing::debug!(
            doc_id = %doc_id,
            category = category.as_str(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
    }

    /// Remove pending retries for a document; returns how many were pending.
    pub fn cancel_all_for(&self, doc_id: &str) -> usize {
        if let Some((_, task)) = self.inner.tasks.remove(doc_id) {
            task.handle.abort();
            self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
            1
        } else {
            0
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.tasks.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            scheduled: self.inner.scheduled.load(Ordering::Relaxed),
            executed: self.inner.executed.load(Ordering::Relaxed),
            cancelled: self.inner.cancelled.load(Ordering::Relaxed),
            replaced: self.inner.replaced.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn strategy(base_ms: u64) -> RetryStrategy {
        RetryStrategy {
            max_retries: 3,
            base_delay_ms: base_ms,
            max_delay_ms: base_ms * 10,
            factor: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn executes_after_the_strategy_delay() {
        let scheduler = RetryScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);

        scheduler.schedule_retry("d1", ErrorCategory::Network, 1, &strategy(50), move || {
            let ran = ran2;
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.stats().executed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_task() {
        let scheduler = RetryScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            scheduler.schedule_retry("d1", ErrorCategory::Network, 1, &strategy(50), move || {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let stats = scheduler.stats();
        assert_eq!(stats.scheduled, 2);
        assert_eq!(stats.replaced, 1);
        assert_eq!(stats.executed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_removes_pending_tasks() {
        let scheduler = RetryScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);

        scheduler.schedule_retry("d1", ErrorCategory::Timeout, 1, &strategy(50), move || {
            let ran = ran2;
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert_eq!(scheduler.cancel_all_for("d1"), 1);
        assert_eq!(scheduler.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.cancel_all_for("d1"), 0);
        assert_eq!(scheduler.stats().cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn independent_documents_do_not_interfere() {
        let scheduler = RetryScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for doc in ["d1", "d2", "d3"] {
            let counter = Arc::clone(&counter);
            scheduler.schedule_retry(doc, ErrorCategory::Network, 1, &strategy(30), move || {
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        assert_eq!(scheduler.pending_count(), 3);
        scheduler.cancel_all_for("d2");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn later_attempts_wait_longer() {
        let scheduler = RetryScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);

        // Attempt 3 with base 50ms and factor 2 → 200ms.
        scheduler.schedule_retry("d1", ErrorCategory::Network, 3, &strategy(50), move || {
            let ran = ran2;
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0, "should still be sleeping");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
